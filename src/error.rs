use std::io;

/// Text the server uses to report a command against a missing filter.
pub(crate) const FILTER_NOT_FOUND: &str = "Filter does not exist";

/// Reserved server text counted toward the internal-error ceiling.
pub(crate) const INTERNAL_ERROR: &str = "Bloomd Internal Error";

/// Errors delivered through command replies and lifecycle events.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server answered the command with an error line. The message is
    /// the verbatim server text, for example `Filter does not exist` or
    /// `Client Error: Bad arguments`. These are application errors, not
    /// transport failures, and leave the connection healthy.
    #[error("{0}")]
    Server(String),
    /// The response frame did not have the shape expected for the command.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    /// The client gave up reconnecting or crossed the internal-error
    /// ceiling. Every command is rejected until `reconnect()` is called.
    #[error("bloomd service unavailable")]
    Unavailable,
    /// The connection was lost while the command was awaiting its response.
    /// Requests already written to the wire are never replayed.
    #[error("connection to bloomd lost")]
    Disconnected,
    /// The client has been disposed and accepts no further commands.
    #[error("client has been disposed")]
    Disposed,
    /// The client configuration could not be read.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),
    /// An I/O error on the underlying socket.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this is the missing-filter error the safe commands intercept.
    pub fn is_filter_not_found(&self) -> bool {
        matches!(self, Error::Server(text) if text == FILTER_NOT_FOUND)
    }
}

/// Alias for `Result` with the crate error type.
pub type Result<T> = std::result::Result<T, Error>;
