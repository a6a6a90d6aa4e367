//! Asynchronous, pipelined client for bloomd-style bloom filter servers.
//!
//! The server speaks a newline-delimited text protocol over TCP and
//! answers requests strictly in arrival order. This client keeps a single
//! connection per instance and pipelines commands over it: a verb method
//! submits its request immediately and hands back a future for the
//! response, so issuing many commands back to back saturates the wire
//! without waiting on round trips.
//!
//! Connections are managed transparently. Commands submitted while the
//! server is unreachable are buffered and flushed in order once it comes
//! back; reconnection uses linear backoff with an optional attempt
//! ceiling, after which the client rejects everything until an explicit
//! [`BloomClient::reconnect`]. The `*_safe` verb variants additionally
//! create a missing filter on demand and retry, holding later commands on
//! that filter so per-filter ordering is preserved.
//!
//! # Example
//!
//! ```no_run
//! use bloomd_client::{BloomClient, ClientConfig, CreateOptions};
//!
//! #[tokio::main]
//! async fn main() -> bloomd_client::Result<()> {
//!     let client = BloomClient::new(ClientConfig::default());
//!     client.create("visitors", &CreateOptions::default()).await?;
//!     client.set("visitors", "alice").await?;
//!     assert!(client.check("visitors", "alice").await?);
//!     Ok(())
//! }
//! ```

mod client;
mod codec;
mod command;
mod config;
mod conn;
mod error;
mod response;

pub use client::{BloomClient, Reply};
pub use command::CreateOptions;
pub use config::ClientConfig;
pub use conn::{ClientStats, Event};
pub use error::{Error, Result};
pub use response::FilterInfo;
