use std::collections::{HashMap, VecDeque};
use std::future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Sleep};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::codec::{Frame, FrameCodec};
use crate::command::{CommandRecord, CreateOptions, Marker, ResponseKind, Verb};
use crate::config::ClientConfig;
use crate::error::{Error, INTERNAL_ERROR};
use crate::response::{decode, Value};

/// Lifecycle notifications published by the engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// The socket connected.
    Connected,
    /// The socket was lost; the client is buffering and will reconnect.
    Disconnected,
    /// The offline queue was fully flushed after a connect.
    Drain,
    /// The client gave up and rejected every pending command.
    Unavailable,
    /// A transport-level fault that is not tied to a single command.
    Error(String),
}

/// Counters shared between the engine and its handles.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub commands_sent: AtomicU64,
    pub errors: AtomicU64,
    pub connection_attempts: AtomicU64,
}

/// Point-in-time snapshot of the client counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    /// Total records ever written to the wire.
    pub commands_sent: u64,
    /// Total internal errors reported by the server.
    pub errors: u64,
    /// Total connection attempts, including reconnections.
    pub connection_attempts: u64,
}

/// Requests delivered from handles to the engine task.
#[derive(Debug)]
pub(crate) enum Op {
    Submit(CommandRecord),
    Reconnect,
    Dispose,
}

type Socket = Framed<TcpStream, FrameCodec>;

/// The owner task for one client instance.
///
/// All client state lives here: the socket, the offline / in-flight /
/// per-filter hold queues, the connection flags and counters. Handles talk
/// to the engine over `ops`; responses travel back per-command over
/// oneshot senders carried in the records; lifecycle events fan out over
/// the broadcast channel.
pub(crate) struct Engine {
    cfg: ClientConfig,
    ops: mpsc::UnboundedReceiver<Op>,
    events: broadcast::Sender<Event>,
    counters: Arc<Counters>,
    socket: Option<Socket>,
    offline: VecDeque<CommandRecord>,
    in_flight: VecDeque<CommandRecord>,
    holds: HashMap<String, VecDeque<CommandRecord>>,
    buffering: bool,
    unavailable: bool,
    disposed: bool,
    attempts: u32,
    errors: u32,
    backoff: Option<Pin<Box<Sleep>>>,
}

impl Engine {
    /// Spawn the engine task and return the submission channel.
    pub(crate) fn spawn(
        cfg: ClientConfig,
        counters: Arc<Counters>,
        events: broadcast::Sender<Event>,
    ) -> mpsc::UnboundedSender<Op> {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Engine {
            cfg,
            ops: rx,
            events,
            counters,
            socket: None,
            offline: VecDeque::new(),
            in_flight: VecDeque::new(),
            holds: HashMap::new(),
            buffering: true,
            unavailable: false,
            disposed: false,
            attempts: 0,
            errors: 0,
            backoff: None,
        };
        tokio::spawn(engine.run());
        tx
    }

    async fn run(mut self) {
        self.try_connect().await;
        loop {
            if self.disposed {
                break;
            }
            tokio::select! {
                op = self.ops.recv() => match op {
                    Some(op) => self.handle_op(op).await,
                    // Every handle is gone; nobody is left to answer.
                    None => self.dispose(),
                },
                frame = next_frame(&mut self.socket) => self.handle_frame(frame).await,
                _ = backoff_elapsed(&mut self.backoff) => {
                    self.backoff = None;
                    self.try_connect().await;
                }
            }
        }
        debug!("engine stopped");
    }

    async fn handle_op(&mut self, op: Op) {
        match op {
            Op::Submit(record) => self.submit(record, false).await,
            Op::Reconnect => self.manual_reconnect().await,
            Op::Dispose => self.dispose(),
        }
    }

    /// The submission procedure: reject when unavailable, park behind an
    /// outstanding safe sequence, buffer while disconnected, otherwise
    /// write. Internal submissions from the safe coordinator bypass the
    /// hold-queue rules.
    async fn submit(&mut self, record: CommandRecord, internal: bool) {
        if self.disposed {
            fail(record, Error::Disposed);
            return;
        }
        if self.unavailable {
            fail(record, Error::Unavailable);
            return;
        }
        let record = if internal {
            record
        } else {
            match self.hold_or_admit(record) {
                Some(record) => record,
                None => return,
            }
        };
        if self.buffering {
            trace!(line = %record.line(), "buffering command");
            self.offline.push_back(record);
            return;
        }
        self.write(record).await;
    }

    /// Apply the hold-queue rules: park the record and return `None`, or
    /// hand it back for submission. A safe command finding no hold queue
    /// for its filter creates one, which is the signal that later commands
    /// on that filter must wait for the safe sequence to finish.
    fn hold_or_admit(&mut self, record: CommandRecord) -> Option<CommandRecord> {
        let name = match &record.filter {
            Some(name) => name.clone(),
            None => return Some(record),
        };
        if let Marker::Safe(_) = record.marker {
            if let Some(queue) = self.holds.get_mut(&name) {
                trace!(filter = %name, "holding safe command behind an earlier safe sequence");
                queue.push_back(record);
                return None;
            }
            self.holds.insert(name, VecDeque::new());
            return Some(record);
        }
        if record.verb == Verb::Create {
            return Some(record);
        }
        if let Some(queue) = self.holds.get_mut(&name) {
            trace!(filter = %name, "holding command behind safe sequence");
            queue.push_back(record);
            return None;
        }
        Some(record)
    }

    async fn write(&mut self, mut record: CommandRecord) {
        let framed = match self.socket.as_mut() {
            Some(framed) => framed,
            None => {
                self.buffering = true;
                self.offline.push_back(record);
                return;
            }
        };
        let line = record.line();
        trace!(%line, "writing command");
        match framed.send(line).await {
            Ok(()) => {
                record.written_at = Some(Utc::now());
                self.counters.commands_sent.fetch_add(1, Ordering::Relaxed);
                self.in_flight.push_back(record);
            }
            Err(err) => {
                warn!("write failed: {}", err);
                // The request may be half on the wire; never replay it.
                if let Some(name) = fail(record, Error::Disconnected) {
                    self.park_held(&name);
                }
                self.emit(Event::Error(err.to_string()));
                self.lost_connection();
            }
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<Frame, Error>>) {
        match frame {
            Some(Ok(frame)) => self.dispatch_frame(frame).await,
            Some(Err(err)) => {
                warn!("socket error: {}", err);
                self.emit(Event::Error(err.to_string()));
                self.lost_connection();
            }
            None => {
                debug!("server closed the connection");
                self.lost_connection();
            }
        }
    }

    /// Match one frame to the head of the in-flight queue, decode it, and
    /// route the outcome through the safe coordinator when the record asks
    /// for it.
    async fn dispatch_frame(&mut self, frame: Frame) {
        let record = match self.in_flight.pop_front() {
            Some(record) => record,
            None => {
                warn!(?frame, "response with no matching command");
                self.emit(Event::Error("response with no matching command".to_string()));
                return;
            }
        };
        if matches!(&frame, Frame::Line(line) if line == INTERNAL_ERROR) {
            self.errors += 1;
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            if self.cfg.max_errors > 0 && self.errors >= self.cfg.max_errors {
                warn!("internal error ceiling of {} reached", self.cfg.max_errors);
                // The record that crossed the ceiling is rejected with the
                // rest of the queues.
                self.in_flight.push_front(record);
                self.go_unavailable();
                return;
            }
        }
        let outcome = decode(&frame, &record);
        if outcome.is_ok() {
            self.errors = self.errors.saturating_sub(1);
        }
        let missing_filter = matches!(&outcome, Err(err) if err.is_filter_not_found());
        match record.marker {
            Marker::Safe(_) if missing_filter => self.begin_safe_create(record).await,
            Marker::SafeCreate(_) => self.finish_safe_create(record, outcome).await,
            _ => self.complete(record, outcome).await,
        }
    }

    /// The original safe command hit a missing filter: create it, then
    /// resubmit the original once the create resolves.
    async fn begin_safe_create(&mut self, mut original: CommandRecord) {
        let filter = original.filter.clone().unwrap_or_default();
        let options = match std::mem::replace(&mut original.marker, Marker::SafeRetry) {
            Marker::Safe(options) => options,
            _ => CreateOptions::default(),
        };
        debug!(%filter, "filter missing, creating it before retrying");
        let mut args = vec![Verb::Create.to_string(), filter.clone()];
        args.extend(options.to_args());
        let mut create = CommandRecord::new(
            Verb::Create,
            args,
            Some(filter),
            ResponseKind::CreateConfirmation,
            None,
        );
        create.marker = Marker::SafeCreate(Box::new(original));
        self.submit(create, true).await;
    }

    /// The coordinator's create resolved: resubmit the original command,
    /// carrying the create failure (if any) so it shadows the stale
    /// missing-filter error.
    async fn finish_safe_create(&mut self, record: CommandRecord, outcome: Result<Value, Error>) {
        let mut original = match record.marker {
            Marker::SafeCreate(original) => *original,
            _ => return,
        };
        if let Err(err) = outcome {
            debug!("create for safe command failed: {}", err);
            original.override_error = Some(err);
        }
        self.submit(original, true).await;
    }

    /// Deliver the outcome to the caller and, when the record ends a safe
    /// sequence (or is an explicit create), release the filter's hold
    /// queue back through the submission path in FIFO order.
    async fn complete(&mut self, mut record: CommandRecord, outcome: Result<Value, Error>) {
        let release = match record.marker {
            Marker::Safe(_) | Marker::SafeRetry | Marker::Create => record.filter.clone(),
            _ => None,
        };
        let outcome = match record.override_error.take() {
            Some(err) if outcome.is_err() => Err(err),
            _ => outcome,
        };
        if self.cfg.debug {
            let elapsed = Utc::now() - record.submitted_at;
            debug!(
                verb = %record.verb,
                ok = outcome.is_ok(),
                elapsed_ms = elapsed.num_milliseconds(),
                "command completed"
            );
        }
        if let Some(reply) = record.reply.take() {
            let _ = reply.send(outcome);
        }
        if let Some(name) = release {
            self.release_holds(&name).await;
        }
    }

    async fn release_holds(&mut self, name: &str) {
        let queue = match self.holds.remove(name) {
            Some(queue) => queue,
            None => return,
        };
        if !queue.is_empty() {
            debug!(filter = %name, held = queue.len(), "releasing held commands");
        }
        for record in queue {
            self.submit(record, false).await;
        }
    }

    /// A held queue whose safe sequence died: move the records to the
    /// offline queue so they are retried after a reconnect.
    fn park_held(&mut self, name: &str) {
        if let Some(queue) = self.holds.remove(name) {
            self.offline.extend(queue);
        }
    }

    fn lost_connection(&mut self) {
        self.socket = None;
        self.buffering = true;
        let mut released = Vec::new();
        for record in self.in_flight.drain(..) {
            if let Some(name) = fail(record, Error::Disconnected) {
                released.push(name);
            }
        }
        for name in released {
            self.park_held(&name);
        }
        self.emit(Event::Disconnected);
        self.schedule_reconnect();
    }

    async fn try_connect(&mut self) {
        if self.disposed || self.unavailable {
            return;
        }
        self.attempts += 1;
        self.counters
            .connection_attempts
            .fetch_add(1, Ordering::Relaxed);
        let addr = self.cfg.addr();
        debug!(%addr, attempt = self.attempts, "connecting");
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                if let Err(err) = stream.set_nodelay(true) {
                    warn!("could not disable Nagle's algorithm: {}", err);
                }
                self.socket = Some(Framed::new(stream, FrameCodec::default()));
                self.emit(Event::Connected);
                self.drain_offline().await;
            }
            Err(err) => {
                debug!(%addr, "connection failed: {}", err);
                self.schedule_reconnect();
            }
        }
    }

    /// Flush the offline queue. Stops early if the socket dies mid-drain;
    /// the drain event only fires on a full flush. Replayed records passed
    /// the hold-queue rules when they were first submitted (a buffered
    /// safe command already owns its filter's hold queue), so they skip
    /// them here instead of parking behind their own entry.
    async fn drain_offline(&mut self) {
        self.buffering = false;
        while !self.buffering {
            let record = match self.offline.pop_front() {
                Some(record) => record,
                None => break,
            };
            self.submit(record, true).await;
        }
        if !self.buffering {
            trace!("offline queue drained");
            self.emit(Event::Drain);
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.disposed || self.backoff.is_some() {
            return;
        }
        if self.cfg.max_connection_attempts > 0 && self.attempts >= self.cfg.max_connection_attempts {
            warn!("giving up after {} connection attempts", self.attempts);
            self.go_unavailable();
            return;
        }
        let delay = self.cfg.backoff(self.attempts);
        debug!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        self.backoff = Some(Box::pin(sleep(delay)));
    }

    async fn manual_reconnect(&mut self) {
        if self.disposed {
            return;
        }
        debug!("explicit reconnect, resetting counters");
        self.unavailable = false;
        self.attempts = 0;
        self.errors = 0;
        self.backoff = None;
        if self.socket.is_none() {
            self.buffering = true;
            self.try_connect().await;
        }
    }

    fn go_unavailable(&mut self) {
        if self.unavailable {
            return;
        }
        self.unavailable = true;
        self.socket = None;
        self.backoff = None;
        self.reject_all(|| Error::Unavailable);
        self.emit(Event::Unavailable);
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        debug!("disposing client");
        self.disposed = true;
        self.socket = None;
        self.backoff = None;
        self.reject_all(|| Error::Disposed);
    }

    /// Drain every queue, failing each record FIFO within its queue.
    fn reject_all<F: Fn() -> Error>(&mut self, err: F) {
        for record in self.in_flight.drain(..) {
            fail(record, err());
        }
        for record in self.offline.drain(..) {
            fail(record, err());
        }
        for (_, queue) in self.holds.drain() {
            for record in queue {
                fail(record, err());
            }
        }
    }

    fn emit(&self, event: Event) {
        trace!(?event, "event");
        let _ = self.events.send(event);
    }
}

/// Deliver a failure to a record, unwrapping a coordinator create down to
/// the original command it carries. Returns the filter whose hold queue
/// the dead record was responsible for releasing, if any.
fn fail(record: CommandRecord, err: Error) -> Option<String> {
    match record.marker {
        Marker::SafeCreate(original) => fail(*original, err),
        Marker::Safe(_) | Marker::SafeRetry => {
            let filter = record.filter.clone();
            if let Some(reply) = record.reply {
                let _ = reply.send(Err(err));
            }
            filter
        }
        _ => {
            if let Some(reply) = record.reply {
                let _ = reply.send(Err(err));
            }
            None
        }
    }
}

async fn next_frame(socket: &mut Option<Socket>) -> Option<Result<Frame, Error>> {
    match socket {
        Some(framed) => framed.next().await,
        None => future::pending().await,
    }
}

async fn backoff_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}
