//! Client-side subscription table.
//!
//! Subscriptions are kept in creation order so they can be re-submitted in
//! that order after a reconnect. Routing is done here as well: targeted
//! deliveries go to one subscription, untargeted ones are matched against
//! every live non-durable subscription.

use std::sync::Arc;

use tracing::{debug, warn};

use super::listener::SubscriptionListener;
use super::options::SubscriptionOptions;
use crate::matcher::Matcher;
use crate::message::{DeliveryTag, Envelope, Message, codec};
use crate::transport::message::{AckMode, ClientMessage, Delivery, DurableType};
use crate::utils::error::{Error, ErrorCode, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Sent (or waiting to be sent) and not yet confirmed.
    Pending,
    Active,
    Failed,
    Closed,
}

pub(crate) struct Subscription {
    pub id: String,
    pub matcher: Matcher,
    pub durable: Option<String>,
    pub options: SubscriptionOptions,
    pub state: SubscriptionState,
    pub listener: Arc<dyn SubscriptionListener>,
}

impl Subscription {
    /// Validates the request and derives the identifier: `d.<name>` for
    /// durables, `s.<seq>` otherwise.
    pub fn prepare(
        seq: u64,
        matcher: &str,
        durable: Option<&str>,
        options: SubscriptionOptions,
        listener: Arc<dyn SubscriptionListener>,
    ) -> Result<Self> {
        let matcher = Matcher::parse(matcher)?;

        let durable = match durable {
            Some(name) if name.trim().is_empty() => {
                return Err(invalid("durable name must not be empty"));
            }
            Some(name) => Some(name.to_string()),
            None => None,
        };

        if durable.is_none() && options.durable_type.is_some() {
            return Err(invalid("durable type given without a durable name"));
        }

        if options.durable_type == Some(DurableType::LastValue) {
            let key = options
                .durable_key
                .as_deref()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| invalid("last-value durable requires a durable key"))?;
            if !matcher.references(key) {
                return Err(invalid(format!(
                    "durable key '{key}' must appear in the matcher"
                )));
            }
        }

        let id = match &durable {
            Some(name) => format!("d.{name}"),
            None => format!("s.{seq}"),
        };

        Ok(Self {
            id,
            matcher,
            durable,
            options,
            state: SubscriptionState::Pending,
            listener,
        })
    }

    pub fn is_durable(&self) -> bool {
        self.durable.is_some()
    }

    fn is_live(&self) -> bool {
        matches!(
            self.state,
            SubscriptionState::Pending | SubscriptionState::Active
        )
    }

    pub fn subscribe_frame(&self) -> ClientMessage {
        ClientMessage::Subscribe {
            id: self.id.clone(),
            matcher: (!self.matcher.is_any()).then(|| self.matcher.as_str().to_string()),
            durable: self.durable.clone(),
            durable_type: self.options.durable_type,
            durable_key: self.options.durable_key.clone(),
            ack_mode: self.options.ack_mode,
        }
    }
}

/// One handler call produced by routing a `deliver` frame.
pub(crate) struct Dispatch {
    pub subscription: String,
    pub listener: Arc<dyn SubscriptionListener>,
    pub ack_mode: AckMode,
    pub messages: Vec<Message>,
}

impl Dispatch {
    /// Highest durable sequence in the batch, for a cumulative auto-ack.
    pub fn last_seq(&self) -> Option<u64> {
        self.messages
            .iter()
            .filter_map(|m| m.delivery().map(|t| t.seq))
            .max()
    }
}

#[derive(Default)]
pub(crate) struct SubscriptionManager {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscription. An identifier that is already live is rejected.
    pub fn insert(&mut self, subscription: Subscription) -> Result<()> {
        if self
            .subscriptions
            .iter()
            .any(|s| s.id == subscription.id && s.is_live())
        {
            return Err(invalid(format!(
                "subscription '{}' already exists on this connection",
                subscription.id
            )));
        }
        self.subscriptions.retain(|s| s.id != subscription.id);
        self.subscriptions.push(subscription);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Subscription> {
        let idx = self.subscriptions.iter().position(|s| s.id == id)?;
        let mut sub = self.subscriptions.remove(idx);
        sub.state = SubscriptionState::Closed;
        Some(sub)
    }

    /// Marks a subscription as confirmed and returns its listener.
    pub fn activate(&mut self, id: &str) -> Option<Arc<dyn SubscriptionListener>> {
        let sub = self.subscriptions.iter_mut().find(|s| s.id == id)?;
        sub.state = SubscriptionState::Active;
        Some(sub.listener.clone())
    }

    /// Removes a subscription the server refused.
    pub fn fail(&mut self, id: &str) -> Option<Subscription> {
        let mut sub = self.remove(id)?;
        sub.state = SubscriptionState::Failed;
        Some(sub)
    }

    pub fn mark_all_pending(&mut self) {
        for sub in self.subscriptions.iter_mut().filter(|s| s.is_live()) {
            sub.state = SubscriptionState::Pending;
        }
    }

    /// Subscribe frames for every live subscription, in creation order.
    pub fn resubscribe_frames(&self) -> Vec<ClientMessage> {
        self.subscriptions
            .iter()
            .filter(|s| s.is_live())
            .map(Subscription::subscribe_frame)
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.subscriptions.iter().map(|s| s.id.clone()).collect()
    }

    pub fn clear(&mut self) -> Vec<Subscription> {
        std::mem::take(&mut self.subscriptions)
    }

    /// Turns a `deliver` frame into handler calls. Messages that fail to
    /// decode are dropped.
    pub fn route(&self, to: Option<&str>, deliveries: Vec<Delivery>) -> Vec<Dispatch> {
        let messages: Vec<Message> = deliveries
            .into_iter()
            .filter_map(|d| decode_delivery(to, d))
            .collect();
        if messages.is_empty() {
            return Vec::new();
        }

        match to {
            Some(id) => match self.get(id).filter(|s| s.is_live()) {
                Some(sub) => vec![Dispatch {
                    subscription: sub.id.clone(),
                    listener: sub.listener.clone(),
                    ack_mode: sub.options.ack_mode,
                    messages,
                }],
                None => {
                    debug!("dropping {} messages for unknown subscription {id}", messages.len());
                    Vec::new()
                }
            },
            None => self
                .subscriptions
                .iter()
                .filter(|s| s.is_live() && !s.is_durable())
                .filter_map(|sub| {
                    let accepted: Vec<Message> = messages
                        .iter()
                        .filter(|m| sub.matcher.matches(m))
                        .cloned()
                        .collect();
                    (!accepted.is_empty()).then(|| Dispatch {
                        subscription: sub.id.clone(),
                        listener: sub.listener.clone(),
                        ack_mode: sub.options.ack_mode,
                        messages: accepted,
                    })
                })
                .collect(),
        }
    }
}

fn decode_delivery(to: Option<&str>, delivery: Delivery) -> Option<Message> {
    match codec::decode(&delivery.body) {
        Ok(mut message) => {
            message.envelope = Envelope {
                delivery: to.zip(delivery.seq).map(|(id, seq)| DeliveryTag {
                    subscription: id.to_string(),
                    seq,
                }),
                reply_to: delivery.reply_to,
            };
            Some(message)
        }
        Err(e) => {
            warn!("dropping undecodable delivery: {e}");
            None
        }
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::operation(ErrorCode::SubscriptionInvalid, reason)
}
