//! Protocol frames exchanged over the WebSocket.
//!
//! Every frame is a JSON text frame tagged by `"type"`. Message bodies are
//! the JSON encoding produced by [`crate::message::codec`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tungstenite::protocol::Message as WsMessage;

use crate::message::ReplyAddress;
use crate::utils::error::{ErrorCode, Result};

/// Durable subscription flavour. Absent means a standard durable owned by a
/// single client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DurableType {
    Shared,
    LastValue,
}

/// How deliveries to a subscription are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AckMode {
    /// Acknowledged by the runtime once the handler returns.
    #[default]
    Auto,
    /// Acknowledged explicitly by the application.
    Client,
    /// Not tracked by the server.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "login")]
    Login {
        username: Option<String>,
        password: Option<String>,
        client_id: Option<String>,
        notification_token: Option<String>,
    },
    #[serde(rename = "subscribe")]
    Subscribe {
        id: String,
        matcher: Option<String>,
        durable: Option<String>,
        durable_type: Option<DurableType>,
        durable_key: Option<String>,
        #[serde(default)]
        ack_mode: AckMode,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { id: String },
    #[serde(rename = "publish")]
    Publish { seq: Option<u64>, body: Value },
    #[serde(rename = "ack")]
    Ack {
        id: String,
        seq: u64,
        #[serde(default)]
        cumulative: bool,
    },
    #[serde(rename = "request")]
    Request { seq: u64, body: Value },
    #[serde(rename = "reply")]
    Reply { to: ReplyAddress, body: Value },
    #[serde(rename = "map_get")]
    MapGet { seq: u64, map: String, key: String },
    #[serde(rename = "map_set")]
    MapSet {
        seq: u64,
        map: String,
        key: String,
        value: Value,
    },
    #[serde(rename = "map_remove")]
    MapRemove { seq: u64, map: String, key: String },
    #[serde(rename = "disconnect")]
    Disconnect {},
}

/// One message inside a `deliver` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Durable sequence number; present when the server expects an ack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Present when the message is a request awaiting a reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyAddress>,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "welcome")]
    Welcome {
        client_id: String,
        max_message_size: usize,
    },
    #[serde(rename = "subscribed")]
    Subscribed { id: String },
    #[serde(rename = "subscription_error")]
    SubscriptionError {
        id: String,
        code: ErrorCode,
        reason: String,
    },
    /// `to` targets a single (durable) subscription; without it the client
    /// routes by matcher.
    #[serde(rename = "deliver")]
    Deliver {
        to: Option<String>,
        messages: Vec<Delivery>,
    },
    #[serde(rename = "publish_ack")]
    PublishAck { seq: u64 },
    #[serde(rename = "publish_error")]
    PublishError {
        seq: u64,
        code: ErrorCode,
        reason: String,
    },
    #[serde(rename = "reply")]
    Reply { seq: u64, body: Value },
    #[serde(rename = "request_error")]
    RequestError {
        seq: u64,
        code: ErrorCode,
        reason: String,
    },
    #[serde(rename = "map_result")]
    MapResult { seq: u64, value: Option<Value> },
    #[serde(rename = "map_error")]
    MapError {
        seq: u64,
        code: ErrorCode,
        reason: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Serializes a frame into a WebSocket text message.
pub fn to_ws<T: Serialize>(frame: &T) -> Result<WsMessage> {
    Ok(WsMessage::text(serde_json::to_string(frame)?))
}
