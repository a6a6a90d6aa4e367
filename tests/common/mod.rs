//! In-process bloomd stand-in used by the integration suites.
//!
//! Filters are exact sets rather than bloom filters, so every expected
//! membership map is deterministic. The server honors the wire protocol:
//! single-line confirmations, `Yes`/`No` booleans, and `START`/`END`
//! blocks for `list` and `info`. Responses can be written in small chunks
//! to exercise frame reassembly, and connections can be dropped after a
//! number of responses to exercise reconnection.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};

const MIN_CAPACITY: u64 = 1000;
const DEFAULT_CAPACITY: u64 = 100_000;
const DEFAULT_PROBABILITY: f64 = 0.0001;

/// Key that makes `set`/`check` answer with the reserved internal error.
pub const BOOM_KEY: &str = "__boom__";

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Write responses in pieces of this many bytes (0 = one write).
    pub chunk: usize,
    /// Close the connection after this many responses (0 = never).
    pub die_after: usize,
}

#[derive(Debug)]
struct FakeFilter {
    capacity: u64,
    probability: f64,
    in_memory: bool,
    keys: HashSet<String>,
    checks: u64,
    check_hits: u64,
    check_misses: u64,
    sets: u64,
    set_hits: u64,
    set_misses: u64,
}

impl FakeFilter {
    fn new(capacity: u64, probability: f64, in_memory: bool) -> Self {
        FakeFilter {
            capacity,
            probability,
            in_memory,
            keys: HashSet::new(),
            checks: 0,
            check_hits: 0,
            check_misses: 0,
            sets: 0,
            set_hits: 0,
            set_misses: 0,
        }
    }

    fn storage(&self) -> u64 {
        self.capacity / 8 + 512
    }

    fn set(&mut self, key: &str) -> bool {
        self.sets += 1;
        let added = self.keys.insert(key.to_string());
        if added {
            self.set_hits += 1;
        } else {
            self.set_misses += 1;
        }
        added
    }

    fn check(&mut self, key: &str) -> bool {
        self.checks += 1;
        let present = self.keys.contains(key);
        if present {
            self.check_hits += 1;
        } else {
            self.check_misses += 1;
        }
        present
    }
}

type FilterDb = Arc<Mutex<HashMap<String, FakeFilter>>>;

/// A running fake server. Aborts its accept loop on drop.
pub struct FakeBloomd {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl FakeBloomd {
    pub async fn start() -> Self {
        Self::start_with(ServerOptions::default()).await
    }

    pub async fn start_with(options: ServerOptions) -> Self {
        Self::start_on("127.0.0.1:0", options).await
    }

    /// Bind a specific address, for tests that reserve a port up front.
    pub async fn start_on(addr: &str, options: ServerOptions) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let db: FilterDb = Arc::new(Mutex::new(HashMap::new()));
        let handle = tokio::spawn(run(listener, db, options));
        FakeBloomd { addr, handle }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for FakeBloomd {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(listener: TcpListener, db: FilterDb, options: ServerOptions) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        let db = db.clone();
        let options = options.clone();
        tokio::spawn(handle_conn(stream, db, options));
    }
}

async fn handle_conn(stream: TcpStream, db: FilterDb, options: ServerOptions) {
    stream.set_nodelay(true).unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = FramedRead::new(read, LinesCodec::new());
    let mut responded = 0;
    while let Some(Ok(line)) = lines.next().await {
        let response = handle_request(&line, &db);
        send_response(&mut write, &response, options.chunk).await;
        responded += 1;
        if options.die_after > 0 && responded >= options.die_after {
            let _ = write.shutdown().await;
            return;
        }
    }
}

async fn send_response(write: &mut OwnedWriteHalf, response: &str, chunk: usize) {
    let bytes = response.as_bytes();
    if chunk == 0 {
        write.write_all(bytes).await.unwrap();
        return;
    }
    for piece in bytes.chunks(chunk) {
        write.write_all(piece).await.unwrap();
        write.flush().await.unwrap();
    }
}

fn handle_request(line: &str, db: &FilterDb) -> String {
    let mut tokens = line.split(' ');
    let verb = tokens.next().unwrap_or_default();
    let args: Vec<&str> = tokens.collect();
    let mut db = db.lock().unwrap();
    match verb {
        "create" => handle_create(&args, &mut db),
        "list" => handle_list(args.first().copied(), &db),
        "drop" => match args.first().and_then(|name| db.remove(*name)) {
            Some(_) => "Done\n".to_string(),
            None => "Filter does not exist\n".to_string(),
        },
        "close" => match args.first().filter(|name| db.contains_key(**name)) {
            Some(_) => "Done\n".to_string(),
            None => "Filter does not exist\n".to_string(),
        },
        "clear" => match args.first().and_then(|name| db.remove(*name)) {
            Some(_) => "Done\n".to_string(),
            None => "Filter does not exist\n".to_string(),
        },
        "flush" => match args.first() {
            Some(name) if !db.contains_key(*name) => "Filter does not exist\n".to_string(),
            _ => "Done\n".to_string(),
        },
        "set" | "check" => handle_single_key(verb, &args, &mut db),
        "multi" | "bulk" => handle_multi_key(verb, &args, &mut db),
        "info" => handle_info(&args, &db),
        _ => "Client Error: Command not supported\n".to_string(),
    }
}

fn handle_create(args: &[&str], db: &mut HashMap<String, FakeFilter>) -> String {
    let name = match args.first() {
        Some(name) => (*name).to_string(),
        None => return "Client Error: Bad arguments\n".to_string(),
    };
    if db.contains_key(&name) {
        return "Exists\n".to_string();
    }
    let mut capacity = DEFAULT_CAPACITY;
    let mut probability = DEFAULT_PROBABILITY;
    let mut in_memory = false;
    for option in &args[1..] {
        let mut pair = option.splitn(2, '=');
        let key = pair.next().unwrap_or_default();
        let value = pair.next().unwrap_or_default();
        match key {
            "capacity" => match value.parse() {
                Ok(parsed) => capacity = parsed,
                Err(_) => return "Client Error: Bad arguments\n".to_string(),
            },
            "prob" => match value.parse() {
                Ok(parsed) => probability = parsed,
                Err(_) => return "Client Error: Bad arguments\n".to_string(),
            },
            "in_memory" => in_memory = value == "1",
            _ => return "Client Error: Bad arguments\n".to_string(),
        }
    }
    if capacity < MIN_CAPACITY {
        return "Client Error: Bad arguments\n".to_string();
    }
    db.insert(name, FakeFilter::new(capacity, probability, in_memory));
    "Done\n".to_string()
}

fn handle_list(prefix: Option<&str>, db: &HashMap<String, FakeFilter>) -> String {
    let mut names: Vec<&String> = db
        .keys()
        .filter(|name| prefix.map_or(true, |p| name.starts_with(p)))
        .collect();
    names.sort();
    let mut response = String::from("START\n");
    for name in names {
        let filter = &db[name];
        response.push_str(&format!(
            "{} {} {} {} {}\n",
            name,
            filter.probability,
            filter.storage(),
            filter.capacity,
            filter.keys.len()
        ));
    }
    response.push_str("END\n");
    response
}

fn handle_single_key(verb: &str, args: &[&str], db: &mut HashMap<String, FakeFilter>) -> String {
    let (name, key) = match (args.first(), args.get(1)) {
        (Some(name), Some(key)) => (*name, *key),
        _ => return "Client Error: Bad arguments\n".to_string(),
    };
    if key == BOOM_KEY {
        return "Bloomd Internal Error\n".to_string();
    }
    let filter = match db.get_mut(name) {
        Some(filter) => filter,
        None => return "Filter does not exist\n".to_string(),
    };
    let answer = if verb == "set" {
        filter.set(key)
    } else {
        filter.check(key)
    };
    if answer {
        "Yes\n".to_string()
    } else {
        "No\n".to_string()
    }
}

fn handle_multi_key(verb: &str, args: &[&str], db: &mut HashMap<String, FakeFilter>) -> String {
    let name = match args.first() {
        Some(name) => *name,
        None => return "Client Error: Bad arguments\n".to_string(),
    };
    let filter = match db.get_mut(name) {
        Some(filter) => filter,
        None => return "Filter does not exist\n".to_string(),
    };
    let answers: Vec<&str> = args[1..]
        .iter()
        .map(|key| {
            let answer = if verb == "bulk" {
                filter.set(key)
            } else {
                filter.check(key)
            };
            if answer {
                "Yes"
            } else {
                "No"
            }
        })
        .collect();
    format!("{}\n", answers.join(" "))
}

fn handle_info(args: &[&str], db: &HashMap<String, FakeFilter>) -> String {
    let filter = match args.first().and_then(|name| db.get(*name)) {
        Some(filter) => filter,
        None => return "Filter does not exist\n".to_string(),
    };
    format!(
        "START\ncapacity {}\nchecks {}\ncheck_hits {}\ncheck_misses {}\nin_memory {}\npage_ins 0\npage_outs 0\nprobability {}\nsets {}\nset_hits {}\nset_misses {}\nsize {}\nstorage {}\nEND\n",
        filter.capacity,
        filter.checks,
        filter.check_hits,
        filter.check_misses,
        if filter.in_memory { 1 } else { 0 },
        filter.probability,
        filter.sets,
        filter.set_hits,
        filter.set_misses,
        filter.keys.len(),
        filter.storage()
    )
}

/// Wait until `events` yields an event matching `pred`, or panic after two
/// seconds.
pub async fn wait_for_event<F>(
    events: &mut tokio::sync::broadcast::Receiver<bloomd_client::Event>,
    mut pred: F,
) -> bloomd_client::Event
where
    F: FnMut(&bloomd_client::Event) -> bool,
{
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
