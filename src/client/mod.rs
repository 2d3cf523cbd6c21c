//! The `client` module is the messaging client runtime.
//!
//! A [`Connection`] holds one multiplexed WebSocket session to a server
//! channel. It reconnects with exponential backoff after transient failures,
//! re-submits its subscriptions after every reconnect, tracks publishes that
//! asked for a completion callback, correlates requests with replies, and
//! gives access to server-side key-value maps.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use eftl::client::{ConnectOptions, Connection, NoopListener};
//! use eftl::message::Message;
//!
//! # async fn run() -> eftl::utils::Result<()> {
//! let conn = Connection::connect(
//!     "ws://user:secret@localhost:9191/channel",
//!     ConnectOptions::new(),
//!     NoopListener,
//! )
//! .await?;
//!
//! conn.subscribe(r#"{"type":"hello"}"#, |_: &Connection, msgs: &[Message]| {
//!     for m in msgs {
//!         println!("{m}");
//!     }
//! })?;
//! conn.publish(Message::new().with("type", "hello").with("text", "hi"))?;
//!
//! let reply = conn
//!     .send_request(Message::new().with("type", "request"), Duration::from_secs(10))
//!     .await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
mod completion;
mod connection;
mod kv;
mod listener;
pub mod options;
mod request;
pub mod state;
mod subscription;
pub mod tls;

pub use backoff::{Backoff, BackoffError};
pub use connection::Connection;
pub use kv::KvMap;
pub use listener::{CompletionListener, ConnectionListener, NoopListener, SubscriptionListener};
pub use options::{ConnectOptions, Endpoint, SubscriptionOptions};
pub use state::ConnectionState;
pub use subscription::SubscriptionState;

pub use crate::transport::message::{AckMode, DurableType};

#[cfg(test)]
mod tests;
