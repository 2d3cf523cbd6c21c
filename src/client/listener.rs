//! Callback interfaces.
//!
//! Every callback of a connection runs on that connection's background task,
//! one at a time. Callbacks must not block; use the `&Connection` they receive
//! to issue further operations.

use super::Connection;
use crate::message::Message;
use crate::transport::close::CloseCode;

pub trait ConnectionListener: Send + Sync {
    /// The initial connect succeeded.
    fn on_connect(&self, connection: &Connection);

    /// The connection is closed and will not be retried automatically. Fires
    /// once per terminal transition.
    fn on_disconnect(&self, connection: &Connection, code: CloseCode, reason: &str);

    /// The connection was re-established after a transport loss or a manual
    /// reconnect.
    fn on_reconnect(&self, _connection: &Connection) {}

    /// Connection-scoped errors that do not end the connection.
    fn on_error(&self, _connection: &Connection, _code: u16, _reason: &str) {}
}

pub trait SubscriptionListener: Send + Sync {
    /// An ordered batch of messages accepted by this subscription.
    fn on_messages(&self, connection: &Connection, messages: &[Message]);

    /// The server confirmed the subscription. Fires again after every
    /// reconnect.
    fn on_subscribe(&self, _connection: &Connection, _subscription_id: &str) {}

    /// The subscription failed and was removed.
    fn on_error(&self, _connection: &Connection, _subscription_id: &str, _code: u16, _reason: &str) {}
}

impl<F> SubscriptionListener for F
where
    F: Fn(&Connection, &[Message]) + Send + Sync,
{
    fn on_messages(&self, connection: &Connection, messages: &[Message]) {
        self(connection, messages)
    }
}

/// Outcome of one publish. Exactly one method fires, exactly once.
pub trait CompletionListener: Send + Sync {
    fn on_completion(&self, message: &Message);

    fn on_error(&self, message: &Message, code: u16, reason: &str);
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl ConnectionListener for NoopListener {
    fn on_connect(&self, _connection: &Connection) {}

    fn on_disconnect(&self, _connection: &Connection, _code: CloseCode, _reason: &str) {}
}
