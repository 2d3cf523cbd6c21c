//! Broker engine
//!
//! This module contains the reference broker the client runtime talks to.
//! Responsibilities:
//! - tracking logged-in sessions by client id (a second login with the same
//!   client id force-closes the first)
//! - non-durable subscriptions: each published message is sent once per
//!   session that has at least one matching subscription; the client fans it
//!   out to its subscriptions by matcher
//! - durable subscriptions (standard, shared, last-value), see [`Durable`]
//! - routing requests like publishes and replies back to the requester
//! - key-value maps persisted through [`MapStore`]
//!
//! The API is synchronous and meant to sit behind `Arc<Mutex<Broker>>`.
//! Frames are queued on each session's channel, so no network I/O happens
//! while the lock is held.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::durable::{Durable, DurableKind};
use super::session::Session;
use crate::matcher::Matcher;
use crate::message::{Message, ReplyAddress, codec};
use crate::persistence::MapStore;
use crate::transport::close::CloseCode;
use crate::transport::message::{AckMode, ClientMessage, Delivery, DurableType, ServerMessage};
use crate::utils::error::{Error, ErrorCode, Result};

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug)]
pub struct Broker {
    pub sessions: HashMap<String, Session>,
    pub durables: HashMap<String, Durable>,
    store: MapStore,
    max_message_size: usize,
}

impl Broker {
    pub fn new(store: MapStore, max_message_size: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            durables: HashMap::new(),
            store,
            max_message_size,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Registers a logged-in session. An existing session with the same
    /// client id is closed with `ForceClose` and detached from its durables.
    pub fn register_session(&mut self, session: Session) {
        if let Some(previous) = self.sessions.remove(&session.client_id) {
            warn!(client = %previous.client_id, "duplicate client id, closing previous session");
            previous.close(CloseCode::ForceClose, "client id logged in elsewhere");
            self.detach_durables(&previous);
        }
        info!(client = %session.client_id, user = ?session.user, "session registered");
        self.sessions.insert(session.client_id.clone(), session);
    }

    /// Removes a session if `token` still identifies the current login.
    /// Durable state survives; only the membership is detached.
    pub fn remove_session(&mut self, client_id: &str, token: Uuid) {
        let current = self
            .sessions
            .get(client_id)
            .is_some_and(|s| s.token == token);
        if !current {
            return;
        }
        if let Some(session) = self.sessions.remove(client_id) {
            self.detach_durables(&session);
            info!(client = %client_id, "session removed");
        }
    }

    fn detach_durables(&mut self, session: &Session) {
        for key in session.durables.values() {
            if let Some(durable) = self.durables.get_mut(key) {
                durable.detach(&session.client_id, session.token, &self.sessions);
            }
        }
    }

    /// Closes every session, e.g. for an administrative restart.
    pub fn close_all(&mut self, code: CloseCode, reason: &str) {
        info!(%code, sessions = self.sessions.len(), "closing all sessions");
        let sessions: Vec<Session> = self.sessions.drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.close(code, reason);
            self.detach_durables(session);
        }
    }

    /// Applies one frame from a logged-in client.
    pub fn handle(&mut self, client_id: &str, frame: ClientMessage) {
        match frame {
            ClientMessage::Login { .. } => self.send_to(
                client_id,
                &ServerMessage::Error {
                    message: "already logged in".into(),
                },
            ),
            ClientMessage::Subscribe {
                id,
                matcher,
                durable,
                durable_type,
                durable_key,
                ack_mode,
            } => self.subscribe(
                client_id,
                &id,
                matcher.as_deref(),
                durable.as_deref(),
                durable_type,
                durable_key.as_deref(),
                ack_mode,
            ),
            ClientMessage::Unsubscribe { id } => self.unsubscribe(client_id, &id),
            ClientMessage::Publish { seq, body } => self.publish(client_id, seq, body),
            ClientMessage::Ack {
                id,
                seq,
                cumulative,
            } => self.acknowledge(client_id, &id, seq, cumulative),
            ClientMessage::Request { seq, body } => self.request(client_id, seq, body),
            ClientMessage::Reply { to, body } => self.reply(client_id, to, body),
            ClientMessage::MapGet { seq, map, key } => {
                let outcome = self.store.get(&map, &key);
                self.answer_map(client_id, seq, outcome);
            }
            ClientMessage::MapSet {
                seq,
                map,
                key,
                value,
            } => self.map_set(client_id, seq, &map, &key, value),
            ClientMessage::MapRemove { seq, map, key } => {
                if !self.may_publish(client_id) {
                    return self.map_error(client_id, seq, ErrorCode::PublishDisallowed, "not allowed");
                }
                let outcome = self.store.remove(&map, &key).map(|_| None);
                self.answer_map(client_id, seq, outcome);
            }
            ClientMessage::Disconnect {} => debug!(client = %client_id, "client disconnecting"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &mut self,
        client_id: &str,
        id: &str,
        matcher: Option<&str>,
        durable: Option<&str>,
        durable_type: Option<DurableType>,
        durable_key: Option<&str>,
        ack_mode: AckMode,
    ) {
        let Some(session) = self.sessions.get(client_id) else {
            return;
        };
        if !session.permissions.can_subscribe {
            return self.subscription_error(
                client_id,
                id,
                ErrorCode::SubscriptionDisallowed,
                "subscribe not permitted for this user",
            );
        }

        let matcher = match Matcher::parse_opt(matcher) {
            Ok(m) => m,
            Err(e) => return self.subscription_error(client_id, id, ErrorCode::SubscriptionInvalid, &e.reason()),
        };

        let Some(name) = durable else {
            if let Some(session) = self.sessions.get_mut(client_id) {
                session.subscriptions.insert(id.to_string(), matcher);
            }
            debug!(client = %client_id, subscription = %id, "subscribed");
            self.send_to(client_id, &ServerMessage::Subscribed { id: id.to_string() });
            return;
        };

        let kind = DurableKind::from_wire(durable_type, durable_key);
        if let DurableKind::LastValue { key } = &kind {
            if key.is_empty() || !matcher.references(key) {
                return self.subscription_error(
                    client_id,
                    id,
                    ErrorCode::SubscriptionInvalid,
                    "last-value durable key must appear in the matcher",
                );
            }
        }

        let storage_key = kind.storage_key(client_id, name);
        if let Some(existing) = self.durables.get(&storage_key) {
            if !existing.matcher.equivalent(&matcher) || existing.kind != kind {
                return self.subscription_error(
                    client_id,
                    id,
                    ErrorCode::SubscriptionInvalid,
                    "durable already exists with different properties",
                );
            }
        }

        if let Some(session) = self.sessions.get_mut(client_id) {
            session
                .durables
                .insert(id.to_string(), storage_key.clone());
        }
        self.send_to(client_id, &ServerMessage::Subscribed { id: id.to_string() });

        let durable = self
            .durables
            .entry(storage_key)
            .or_insert_with(|| Durable::new(name, kind, matcher));
        if let Some(session) = self.sessions.get(client_id) {
            durable.attach(session, id, ack_mode, &self.sessions);
        }
        debug!(client = %client_id, subscription = %id, durable = %name, "durable attached");
    }

    pub fn unsubscribe(&mut self, client_id: &str, id: &str) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        if session.subscriptions.remove(id).is_some() {
            debug!(client = %client_id, subscription = %id, "unsubscribed");
            return;
        }
        let Some(key) = session.durables.remove(id) else {
            return;
        };
        let empty = self
            .durables
            .get_mut(&key)
            .is_some_and(|d| d.remove_member(client_id, &self.sessions));
        if empty {
            self.durables.remove(&key);
            info!(durable = %key, "durable removed");
        }
    }

    pub fn acknowledge(&mut self, client_id: &str, id: &str, seq: u64, cumulative: bool) {
        let Some(key) = self
            .sessions
            .get(client_id)
            .and_then(|s| s.durables.get(id))
        else {
            return;
        };
        if let Some(durable) = self.durables.get_mut(key) {
            durable.acknowledge(client_id, seq, cumulative);
        }
    }

    pub fn publish(&mut self, client_id: &str, seq: Option<u64>, body: Value) {
        let fail = |broker: &Self, code: ErrorCode, reason: &str| {
            warn!(client = %client_id, "publish rejected: {reason}");
            if let Some(seq) = seq {
                broker.send_to(
                    client_id,
                    &ServerMessage::PublishError {
                        seq,
                        code,
                        reason: reason.to_string(),
                    },
                );
            }
        };

        if !self.may_publish(client_id) {
            return fail(self, ErrorCode::PublishDisallowed, "publish not permitted for this user");
        }
        let message = match self.admit(&body) {
            Ok(message) => message,
            Err(e) => return fail(self, ErrorCode::PublishFailed, &e.reason()),
        };

        self.route(&message, &body, None);
        for durable in self.durables.values_mut() {
            durable.publish(&message, &body, &self.sessions);
        }

        if let Some(seq) = seq {
            self.send_to(client_id, &ServerMessage::PublishAck { seq });
        }
    }

    /// Requests go to non-durable subscribers only, carrying a reply address.
    pub fn request(&mut self, client_id: &str, seq: u64, body: Value) {
        let error = |code: ErrorCode, reason: String| ServerMessage::RequestError { seq, code, reason };

        if !self.may_publish(client_id) {
            return self.send_to(
                client_id,
                &error(ErrorCode::RequestDisallowed, "request not permitted for this user".into()),
            );
        }
        let message = match self.admit(&body) {
            Ok(message) => message,
            Err(e) => return self.send_to(client_id, &error(ErrorCode::RequestFailed, e.reason())),
        };

        let reply_to = ReplyAddress {
            client_id: client_id.to_string(),
            request_id: seq,
        };
        let receivers = self.route(&message, &body, Some(reply_to));
        debug!(client = %client_id, seq, receivers, "request routed");
    }

    pub fn reply(&mut self, client_id: &str, to: ReplyAddress, body: Value) {
        if !self.may_publish(client_id) {
            warn!(client = %client_id, "reply not permitted");
            return;
        }
        match self.sessions.get(&to.client_id) {
            Some(requester) => {
                requester.send(&ServerMessage::Reply {
                    seq: to.request_id,
                    body,
                });
            }
            None => debug!(requester = %to.client_id, "dropping reply for absent client"),
        }
    }

    fn map_set(&mut self, client_id: &str, seq: u64, map: &str, key: &str, value: Value) {
        if !self.may_publish(client_id) {
            return self.map_error(client_id, seq, ErrorCode::PublishDisallowed, "not allowed");
        }
        if let Err(e) = self.admit(&value) {
            return self.map_error(client_id, seq, ErrorCode::RequestFailed, &e.reason());
        }
        let outcome = self.store.set(map, key, value).map(|_| None);
        self.answer_map(client_id, seq, outcome);
    }

    fn answer_map(&self, client_id: &str, seq: u64, outcome: Result<Option<Value>>) {
        match outcome {
            Ok(value) => self.send_to(client_id, &ServerMessage::MapResult { seq, value }),
            Err(e) => {
                warn!("map operation failed: {e}");
                self.map_error(client_id, seq, ErrorCode::RequestFailed, &e.reason());
            }
        }
    }

    fn map_error(&self, client_id: &str, seq: u64, code: ErrorCode, reason: &str) {
        self.send_to(
            client_id,
            &ServerMessage::MapError {
                seq,
                code,
                reason: reason.to_string(),
            },
        );
    }

    /// Size check and decode of an inbound body.
    fn admit(&self, body: &Value) -> Result<Message> {
        let len = serde_json::to_vec(body)?.len();
        if len > self.max_message_size {
            return Err(Error::operation(
                ErrorCode::PublishFailed,
                format!("message of {len} bytes exceeds maximum of {}", self.max_message_size),
            ));
        }
        codec::decode(body)
    }

    /// Sends `message` once to every session with a matching non-durable
    /// subscription. Returns the number of sessions reached.
    fn route(&self, message: &Message, body: &Value, reply_to: Option<ReplyAddress>) -> usize {
        let frame = ServerMessage::Deliver {
            to: None,
            messages: vec![Delivery {
                seq: None,
                reply_to,
                body: body.clone(),
            }],
        };
        self.sessions
            .values()
            .filter(|s| s.wants(message))
            .filter(|s| s.send(&frame))
            .count()
    }

    fn may_publish(&self, client_id: &str) -> bool {
        self.sessions
            .get(client_id)
            .is_some_and(|s| s.permissions.can_publish)
    }

    fn subscription_error(&self, client_id: &str, id: &str, code: ErrorCode, reason: &str) {
        warn!(client = %client_id, subscription = %id, %code, "{reason}");
        self.send_to(
            client_id,
            &ServerMessage::SubscriptionError {
                id: id.to_string(),
                code,
                reason: reason.to_string(),
            },
        );
    }

    fn send_to(&self, client_id: &str, frame: &ServerMessage) {
        if let Some(session) = self.sessions.get(client_id) {
            session.send(frame);
        }
    }
}
