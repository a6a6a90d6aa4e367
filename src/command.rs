use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::error::Error;
use crate::response::Value;

/// Protocol verbs, rendered lowercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Verb {
    Create,
    List,
    Drop,
    Close,
    Clear,
    Flush,
    Check,
    Set,
    Multi,
    Bulk,
    Info,
}

/// Response shape expected for a command; selects the decoding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseKind {
    Bool,
    BoolList,
    Confirmation,
    CreateConfirmation,
    DropConfirmation,
    FilterList,
    Info,
}

/// Options forwarded to `create`. Keys are passed through to the server as
/// `key=value` tokens and are not interpreted by the client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOptions {
    /// Target false-positive probability.
    pub prob: Option<f64>,
    /// Initial filter capacity.
    pub capacity: Option<u64>,
    /// Keep the filter entirely in memory.
    pub in_memory: Option<bool>,
}

impl CreateOptions {
    pub(crate) fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(capacity) = self.capacity {
            args.push(format!("capacity={}", capacity));
        }
        if let Some(prob) = self.prob {
            args.push(format!("prob={}", prob));
        }
        if let Some(in_memory) = self.in_memory {
            args.push(format!("in_memory={}", if in_memory { 1 } else { 0 }));
        }
        args
    }
}

/// Safe-command coordinator state carried on a record and inspected in the
/// engine receive loop.
#[derive(Debug)]
pub(crate) enum Marker {
    /// Plain command.
    None,
    /// First pass of a safe command. A missing-filter error triggers an
    /// automatic create with these options; any completion releases the
    /// filter's hold queue.
    Safe(CreateOptions),
    /// The original safe command, resubmitted after its create finished.
    /// Completion releases the filter's hold queue.
    SafeRetry,
    /// Create issued by the coordinator. Completion resubmits the boxed
    /// original command instead of replying to the user.
    SafeCreate(Box<CommandRecord>),
    /// Explicit user create. Completion releases the filter's hold queue,
    /// covering callers who create filters themselves instead of going
    /// through a safe command.
    Create,
}

pub(crate) type ReplySender = oneshot::Sender<Result<Value, Error>>;

/// One pending request: what was asked, where its answer goes, and where
/// the record currently sits in the pipeline.
#[derive(Debug)]
pub(crate) struct CommandRecord {
    pub verb: Verb,
    /// Verb and operands, joined with single spaces on the wire.
    pub args: Vec<String>,
    pub filter: Option<String>,
    pub kind: ResponseKind,
    pub reply: Option<ReplySender>,
    /// Substituted for the decoded error by the safe coordinator, so the
    /// user sees why a create failed instead of the stale missing-filter
    /// error.
    pub override_error: Option<Error>,
    pub marker: Marker,
    pub submitted_at: DateTime<Utc>,
    pub written_at: Option<DateTime<Utc>>,
}

impl CommandRecord {
    pub fn new(
        verb: Verb,
        args: Vec<String>,
        filter: Option<String>,
        kind: ResponseKind,
        reply: Option<ReplySender>,
    ) -> Self {
        CommandRecord {
            verb,
            args,
            filter,
            kind,
            reply,
            override_error: None,
            marker: Marker::None,
            submitted_at: Utc::now(),
            written_at: None,
        }
    }

    /// Wire rendering, without the trailing terminator.
    pub fn line(&self) -> String {
        self.args.join(" ")
    }

    /// Key operands of a multi/bulk command, positionally matching the
    /// booleans in its response line.
    pub fn keys(&self) -> &[String] {
        if self.args.len() > 2 {
            &self.args[2..]
        } else {
            &[]
        }
    }
}
