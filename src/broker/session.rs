use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;
use tungstenite::protocol::{CloseFrame, Message as WsMessage};
use uuid::Uuid;

use crate::matcher::Matcher;
use crate::transport::close::CloseCode;
use crate::transport::message::{ServerMessage, to_ws};

/// What an authenticated user may do. Anonymous sessions may do everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub can_publish: bool,
    pub can_subscribe: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            can_publish: true,
            can_subscribe: true,
        }
    }
}

/// A logged-in WebSocket client.
///
/// Each session is identified by its client id plus a per-login `token`, so
/// the cleanup of a session replaced by a newer login with the same client id
/// never touches the newer one.
#[derive(Debug)]
pub struct Session {
    pub client_id: String,
    pub token: Uuid,
    pub user: Option<String>,
    pub permissions: Permissions,

    /// Channel to the socket's writer task.
    pub sender: UnboundedSender<WsMessage>,

    /// Non-durable subscriptions by subscription id.
    pub subscriptions: HashMap<String, Matcher>,

    /// Durable memberships: subscription id to durable key.
    pub durables: HashMap<String, String>,
}

impl Session {
    pub fn new(
        client_id: String,
        user: Option<String>,
        permissions: Permissions,
        sender: UnboundedSender<WsMessage>,
    ) -> Self {
        Self {
            client_id,
            token: Uuid::new_v4(),
            user,
            permissions,
            sender,
            subscriptions: HashMap::new(),
            durables: HashMap::new(),
        }
    }

    /// Queues a frame for the writer task. Returns false if the socket is gone.
    pub fn send(&self, frame: &ServerMessage) -> bool {
        match to_ws(frame) {
            Ok(message) => self.sender.send(message).is_ok(),
            Err(e) => {
                warn!("failed to encode frame for {}: {e}", self.client_id);
                false
            }
        }
    }

    /// Asks the writer task to close the socket with `code`.
    pub fn close(&self, code: CloseCode, reason: &str) {
        let frame = CloseFrame {
            code: code.into(),
            reason: reason.to_string().into(),
        };
        let _ = self.sender.send(WsMessage::Close(Some(frame)));
    }

    /// Whether any non-durable subscription accepts `message`.
    pub fn wants(&self, message: &crate::message::Message) -> bool {
        self.subscriptions.values().any(|m| m.matches(message))
    }
}
