//! The `message` module defines the self-describing payload exchanged by every
//! operation: an ordered set of uniquely named, typed fields.
//!
//! A `Message` is mutable while the caller builds it and is moved (or cloned)
//! into the connection when handed to `publish`, `send_request` or
//! `send_reply`, so the transport never observes concurrent mutation.
//!
//! # Example
//!
//! ```rust
//! use eftl::message::Message;
//!
//! let msg = Message::new()
//!     .with("type", "hello")
//!     .with("text", "hi")
//!     .with("count", 3i64);
//! assert_eq!(msg.get_string("text"), Some("hi"));
//! ```

pub mod codec;
pub mod value;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use value::FieldValue;

/// Reserved field name carrying destination routing by convention.
pub const DESTINATION_FIELD: &str = "_dest";

/// Where the reply to a delivered request has to be sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyAddress {
    pub client_id: String,
    pub request_id: u64,
}

/// Identifies a durable delivery for acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeliveryTag {
    pub subscription: String,
    pub seq: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Envelope {
    pub delivery: Option<DeliveryTag>,
    pub reply_to: Option<ReplyAddress>,
}

/// Ordered mapping of field name to typed value. Field names are unique;
/// setting an existing name replaces the value in place.
#[derive(Debug, Clone, Default)]
pub struct Message {
    fields: Vec<(String, FieldValue)>,
    pub(crate) envelope: Envelope,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style `set`.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Sets a field. Last write wins, the original position is kept.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_str)
    }

    pub fn get_long(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(FieldValue::as_long)
    }

    pub fn get_double(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FieldValue::as_double)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(FieldValue::as_bool)
    }

    pub fn get_datetime(&self, name: &str) -> Option<DateTime<Utc>> {
        self.get(name).and_then(FieldValue::as_datetime)
    }

    pub fn get_opaque(&self, name: &str) -> Option<&[u8]> {
        self.get(name).and_then(FieldValue::as_opaque)
    }

    pub fn get_message(&self, name: &str) -> Option<&Message> {
        self.get(name).and_then(FieldValue::as_message)
    }

    /// Field names in insertion order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) -> &mut Self {
        self.set(DESTINATION_FIELD, destination.into())
    }

    pub fn destination(&self) -> Option<&str> {
        self.get_string(DESTINATION_FIELD)
    }

    /// Reply address when this message was delivered as a request.
    pub fn reply_to(&self) -> Option<&ReplyAddress> {
        self.envelope.reply_to.as_ref()
    }

    pub fn is_request(&self) -> bool {
        self.envelope.reply_to.is_some()
    }

    /// Durable subscription and sequence number, if the server tracks
    /// acknowledgement for this delivery.
    pub(crate) fn delivery(&self) -> Option<&DeliveryTag> {
        self.envelope.delivery.as_ref()
    }

    /// Size of the wire encoding in bytes.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(&codec::encode(self))
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

/// Equality considers fields only, never delivery metadata.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", codec::encode(self))
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for Message {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut msg = Message::new();
        for (k, v) in iter {
            msg.set(k, v);
        }
        msg
    }
}

#[cfg(test)]
mod tests;
