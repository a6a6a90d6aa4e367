use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};

use log::debug;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::command::{CommandRecord, CreateOptions, Marker, ResponseKind, Verb};
use crate::config::ClientConfig;
use crate::conn::{ClientStats, Counters, Engine, Event, Op};
use crate::error::Error;
use crate::response::{FilterInfo, Value};

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Handle to one client instance.
///
/// Commands are submitted to the engine task the moment a verb method is
/// called, so calling several methods back to back pipelines the requests
/// in call order; each returned [`Reply`] resolves when the matching
/// response arrives. Cloned handles share the same connection, queues and
/// counters. Dropping the last handle disposes the engine.
///
/// While the connection is down, commands are buffered and flushed in
/// submission order once the server is reachable again; see
/// [`ClientConfig`] for the reconnection and error ceilings.
#[derive(Debug, Clone)]
pub struct BloomClient {
    ops: mpsc::UnboundedSender<Op>,
    events: broadcast::Sender<Event>,
    counters: Arc<Counters>,
}

impl BloomClient {
    /// Create a client and start connecting to the configured server.
    pub fn new(config: ClientConfig) -> Self {
        debug!("starting bloomd client for {}:{}", config.host, config.port);
        let counters = Arc::new(Counters::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let ops = Engine::spawn(config, counters.clone(), events.clone());
        BloomClient { ops, events, counters }
    }

    /// Create a filter. Resolves to `true` when the filter was created or
    /// already existed.
    pub fn create(&self, filter: &str, options: &CreateOptions) -> Reply<bool> {
        let mut args = vec![Verb::Create.to_string(), filter.to_string()];
        args.extend(options.to_args());
        let mut record = self.record(Verb::Create, args, Some(filter), ResponseKind::CreateConfirmation);
        record.0.marker = Marker::Create;
        self.dispatch(record, Value::into_flag)
    }

    /// List filters, optionally restricted to a name prefix.
    pub fn list(&self, prefix: Option<&str>) -> Reply<Vec<FilterInfo>> {
        let mut args = vec![Verb::List.to_string()];
        if let Some(prefix) = prefix {
            args.push(prefix.to_string());
        }
        let record = self.record(Verb::List, args, None, ResponseKind::FilterList);
        self.dispatch(record, Value::into_filters)
    }

    /// Fetch the detailed metadata of one filter.
    pub fn info(&self, filter: &str) -> Reply<FilterInfo> {
        let args = vec![Verb::Info.to_string(), filter.to_string()];
        let record = self.record(Verb::Info, args, Some(filter), ResponseKind::Info);
        self.dispatch(record, Value::into_info)
    }

    /// Add a key to a filter. Resolves to `true` when the key was not
    /// already present.
    pub fn set(&self, filter: &str, key: &str) -> Reply<bool> {
        let args = vec![Verb::Set.to_string(), filter.to_string(), key.to_string()];
        let record = self.record(Verb::Set, args, Some(filter), ResponseKind::Bool);
        self.dispatch(record, Value::into_flag)
    }

    /// Test a key for membership.
    pub fn check(&self, filter: &str, key: &str) -> Reply<bool> {
        let args = vec![Verb::Check.to_string(), filter.to_string(), key.to_string()];
        let record = self.record(Verb::Check, args, Some(filter), ResponseKind::Bool);
        self.dispatch(record, Value::into_flag)
    }

    /// Test several keys at once. Resolves to a map from key to
    /// membership.
    pub fn multi(&self, filter: &str, keys: &[&str]) -> Reply<HashMap<String, bool>> {
        let record = self.keyed(Verb::Multi, filter, keys);
        self.dispatch(record, Value::into_flags)
    }

    /// Add several keys at once. Resolves to a map from key to "was newly
    /// added".
    pub fn bulk(&self, filter: &str, keys: &[&str]) -> Reply<HashMap<String, bool>> {
        let record = self.keyed(Verb::Bulk, filter, keys);
        self.dispatch(record, Value::into_flags)
    }

    /// Drop a filter. A filter that is already gone counts as dropped.
    pub fn drop_filter(&self, filter: &str) -> Reply<bool> {
        let args = vec![Verb::Drop.to_string(), filter.to_string()];
        let record = self.record(Verb::Drop, args, Some(filter), ResponseKind::DropConfirmation);
        self.dispatch(record, Value::into_flag)
    }

    /// Unmap a filter from memory without deleting its data.
    pub fn close_filter(&self, filter: &str) -> Reply<bool> {
        let args = vec![Verb::Close.to_string(), filter.to_string()];
        let record = self.record(Verb::Close, args, Some(filter), ResponseKind::Confirmation);
        self.dispatch(record, Value::into_flag)
    }

    /// Remove a closed filter from the server's filter list.
    pub fn clear_filter(&self, filter: &str) -> Reply<bool> {
        let args = vec![Verb::Clear.to_string(), filter.to_string()];
        let record = self.record(Verb::Clear, args, Some(filter), ResponseKind::Confirmation);
        self.dispatch(record, Value::into_flag)
    }

    /// Flush a filter to disk, or every filter when `filter` is `None`.
    pub fn flush(&self, filter: Option<&str>) -> Reply<bool> {
        let mut args = vec![Verb::Flush.to_string()];
        if let Some(name) = filter {
            args.push(name.to_string());
        }
        let record = self.record(Verb::Flush, args, filter, ResponseKind::Confirmation);
        self.dispatch(record, Value::into_flag)
    }

    /// [`set`](Self::set) that transparently creates a missing filter with
    /// `options` and retries. Commands on the same filter submitted while
    /// the sequence is in flight are held and replayed in order afterwards.
    pub fn set_safe(&self, filter: &str, key: &str, options: &CreateOptions) -> Reply<bool> {
        let args = vec![Verb::Set.to_string(), filter.to_string(), key.to_string()];
        let mut record = self.record(Verb::Set, args, Some(filter), ResponseKind::Bool);
        record.0.marker = Marker::Safe(options.clone());
        self.dispatch(record, Value::into_flag)
    }

    /// [`check`](Self::check) with create-on-missing semantics.
    pub fn check_safe(&self, filter: &str, key: &str, options: &CreateOptions) -> Reply<bool> {
        let args = vec![Verb::Check.to_string(), filter.to_string(), key.to_string()];
        let mut record = self.record(Verb::Check, args, Some(filter), ResponseKind::Bool);
        record.0.marker = Marker::Safe(options.clone());
        self.dispatch(record, Value::into_flag)
    }

    /// [`multi`](Self::multi) with create-on-missing semantics.
    pub fn multi_safe(
        &self,
        filter: &str,
        keys: &[&str],
        options: &CreateOptions,
    ) -> Reply<HashMap<String, bool>> {
        let mut record = self.keyed(Verb::Multi, filter, keys);
        record.0.marker = Marker::Safe(options.clone());
        self.dispatch(record, Value::into_flags)
    }

    /// [`bulk`](Self::bulk) with create-on-missing semantics.
    pub fn bulk_safe(
        &self,
        filter: &str,
        keys: &[&str],
        options: &CreateOptions,
    ) -> Reply<HashMap<String, bool>> {
        let mut record = self.keyed(Verb::Bulk, filter, keys);
        record.0.marker = Marker::Safe(options.clone());
        self.dispatch(record, Value::into_flags)
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Snapshot of the client counters.
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            commands_sent: self.counters.commands_sent.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            connection_attempts: self.counters.connection_attempts.load(Ordering::Relaxed),
        }
    }

    /// Leave the unavailable state: reset the connection-attempt and error
    /// counters and try to connect again.
    pub fn reconnect(&self) {
        let _ = self.ops.send(Op::Reconnect);
    }

    /// Tear the client down. Pending and future commands fail with
    /// [`Error::Disposed`]; no reconnection is attempted.
    pub fn dispose(&self) {
        let _ = self.ops.send(Op::Dispose);
    }

    fn record(
        &self,
        verb: Verb,
        args: Vec<String>,
        filter: Option<&str>,
        kind: ResponseKind,
    ) -> Pending {
        let (tx, rx) = oneshot::channel();
        let record = CommandRecord::new(verb, args, filter.map(|f| f.to_string()), kind, Some(tx));
        Pending(record, rx)
    }

    fn keyed(&self, verb: Verb, filter: &str, keys: &[&str]) -> Pending {
        let mut args = Vec::with_capacity(keys.len() + 2);
        args.push(verb.to_string());
        args.push(filter.to_string());
        args.extend(keys.iter().map(|key| key.to_string()));
        self.record(verb, args, Some(filter), ResponseKind::BoolList)
    }

    fn dispatch<T>(&self, pending: Pending, convert: fn(Value) -> Result<T, Error>) -> Reply<T> {
        let Pending(record, rx) = pending;
        match self.ops.send(Op::Submit(record)) {
            Ok(()) => Reply {
                state: ReplyState::Waiting(rx),
                convert,
            },
            Err(_) => Reply {
                state: ReplyState::Failed(Some(Error::Disposed)),
                convert,
            },
        }
    }
}

/// A record built by a verb method, paired with the receiving half of its
/// reply channel.
struct Pending(CommandRecord, oneshot::Receiver<Result<Value, Error>>);

/// Future resolving to the typed result of one submitted command.
///
/// The command is already on its way when the `Reply` is handed out;
/// dropping it discards the eventual response without cancelling the
/// command.
#[derive(Debug)]
pub struct Reply<T> {
    state: ReplyState,
    convert: fn(Value) -> Result<T, Error>,
}

#[derive(Debug)]
enum ReplyState {
    Waiting(oneshot::Receiver<Result<Value, Error>>),
    Failed(Option<Error>),
}

impl<T> Future for Reply<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        match &mut this.state {
            ReplyState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(Ok(value))) => Poll::Ready((this.convert)(value)),
                Poll::Ready(Ok(Err(err))) => Poll::Ready(Err(err)),
                // The engine dropped the reply without answering, which
                // only happens on teardown.
                Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Disposed)),
                Poll::Pending => Poll::Pending,
            },
            ReplyState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or(Error::Disposed))),
        }
    }
}
