//! Server-side durable subscription state.
//!
//! Three flavours share one structure:
//!
//! - standard: owned by one client id; messages published while the client
//!   is away are kept in a backlog, and delivered-but-unacknowledged messages
//!   are redelivered when it comes back;
//! - shared: any number of members; each message goes to one attached member
//!   in turn, and the backlog builds up while nobody is attached;
//! - last-value: only the most recent message per key value is kept; a member
//!   receives the whole snapshot on attach and every update after that.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::session::Session;
use crate::matcher::Matcher;
use crate::message::Message;
use crate::transport::message::{AckMode, Delivery, DurableType, ServerMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableKind {
    Standard,
    Shared,
    LastValue { key: String },
}

impl DurableKind {
    pub fn from_wire(durable_type: Option<DurableType>, durable_key: Option<&str>) -> Self {
        match durable_type {
            None => DurableKind::Standard,
            Some(DurableType::Shared) => DurableKind::Shared,
            Some(DurableType::LastValue) => DurableKind::LastValue {
                key: durable_key.unwrap_or_default().to_string(),
            },
        }
    }

    /// Key under which the broker stores the durable.
    pub fn storage_key(&self, client_id: &str, name: &str) -> String {
        match self {
            DurableKind::Standard => format!("standard:{client_id}:{name}"),
            DurableKind::Shared => format!("shared:{name}"),
            DurableKind::LastValue { .. } => format!("last-value:{name}"),
        }
    }
}

#[derive(Debug, Clone)]
struct Stored {
    seq: u64,
    body: Value,
}

#[derive(Debug)]
struct Member {
    client_id: String,
    token: Uuid,
    subscription_id: String,
    ack_mode: AckMode,
    attached: bool,
}

impl Member {
    fn tracks_acks(&self) -> bool {
        self.ack_mode != AckMode::None
    }
}

#[derive(Debug)]
pub struct Durable {
    pub name: String,
    pub kind: DurableKind,
    pub matcher: Matcher,
    members: Vec<Member>,
    next_seq: u64,
    backlog: VecDeque<Stored>,
    /// Delivered and waiting for an ack, with the owning client id.
    unacked: BTreeMap<u64, (String, Stored)>,
    last_values: BTreeMap<String, Value>,
    cursor: usize,
}

impl Durable {
    pub fn new(name: &str, kind: DurableKind, matcher: Matcher) -> Self {
        Self {
            name: name.to_string(),
            kind,
            matcher,
            members: Vec::new(),
            next_seq: 1,
            backlog: VecDeque::new(),
            unacked: BTreeMap::new(),
            last_values: BTreeMap::new(),
            cursor: 0,
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// Attaches `session` under `subscription_id`, then sends whatever the
    /// member is owed: the snapshot for last-value, the backlog otherwise.
    pub fn attach(
        &mut self,
        session: &Session,
        subscription_id: &str,
        ack_mode: AckMode,
        sessions: &HashMap<String, Session>,
    ) {
        self.members.retain(|m| m.client_id != session.client_id);
        self.members.push(Member {
            client_id: session.client_id.clone(),
            token: session.token,
            subscription_id: subscription_id.to_string(),
            ack_mode,
            attached: true,
        });
        let idx = self.members.len() - 1;
        debug!(durable = %self.name, client = %session.client_id, "member attached");

        match self.kind {
            DurableKind::LastValue { .. } => {
                let snapshot: Vec<Delivery> = self
                    .last_values
                    .values()
                    .map(|body| Delivery {
                        seq: None,
                        reply_to: None,
                        body: body.clone(),
                    })
                    .collect();
                send(sessions, &self.members[idx], snapshot);
            }
            DurableKind::Standard => {
                // Unacknowledged first, then the backlog, all in seq order.
                let owed: Vec<Stored> = self
                    .unacked
                    .values()
                    .filter(|(owner, _)| *owner == session.client_id)
                    .map(|(_, s)| s.clone())
                    .chain(self.backlog.drain(..))
                    .collect();
                self.deliver_to(idx, owed, sessions);
            }
            DurableKind::Shared => {
                let owed: Vec<Stored> = self.backlog.drain(..).collect();
                self.deliver_to(idx, owed, sessions);
            }
        }
    }

    /// Marks the member of a closed session as away. State is kept.
    pub fn detach(&mut self, client_id: &str, token: Uuid, sessions: &HashMap<String, Session>) {
        let Some(member) = self
            .members
            .iter_mut()
            .find(|m| m.client_id == client_id && m.token == token)
        else {
            return;
        };
        member.attached = false;
        debug!(durable = %self.name, client = %client_id, "member detached");

        if matches!(self.kind, DurableKind::Shared) {
            self.members.retain(|m| m.attached || m.client_id != client_id);
            self.requeue_unacked_of(client_id, sessions);
        }
    }

    /// Explicit unsubscribe. Returns true when no members are left and the
    /// durable should be dropped.
    pub fn remove_member(&mut self, client_id: &str, sessions: &HashMap<String, Session>) -> bool {
        self.members.retain(|m| m.client_id != client_id);
        if matches!(self.kind, DurableKind::Shared) {
            self.requeue_unacked_of(client_id, sessions);
        }
        self.members.is_empty()
    }

    pub fn acknowledge(&mut self, client_id: &str, seq: u64, cumulative: bool) {
        self.unacked.retain(|s, (owner, _)| {
            let covered = if cumulative { *s <= seq } else { *s == seq };
            !(covered && owner == client_id)
        });
    }

    /// Offers a published message to the durable.
    pub fn publish(&mut self, message: &Message, body: &Value, sessions: &HashMap<String, Session>) {
        if !self.matcher.matches(message) {
            return;
        }

        if let DurableKind::LastValue { key } = &self.kind {
            let Some(key_value) = message.get(key).and_then(|v| v.key_string()) else {
                debug!(durable = %self.name, "message lacks key field '{key}'");
                return;
            };
            self.last_values.insert(key_value, body.clone());
            for member in self.members.iter().filter(|m| m.attached) {
                send(
                    sessions,
                    member,
                    vec![Delivery {
                        seq: None,
                        reply_to: None,
                        body: body.clone(),
                    }],
                );
            }
            return;
        }

        let stored = Stored {
            seq: self.next_seq,
            body: body.clone(),
        };
        self.next_seq += 1;

        match self.pick_member() {
            Some(idx) => self.deliver_to(idx, vec![stored], sessions),
            None => self.backlog.push_back(stored),
        }
    }

    /// Next attached member: the owner for standard, round-robin for shared.
    fn pick_member(&mut self) -> Option<usize> {
        let attached: Vec<usize> = self
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.attached)
            .map(|(i, _)| i)
            .collect();
        if attached.is_empty() {
            return None;
        }
        let idx = attached[self.cursor % attached.len()];
        self.cursor = self.cursor.wrapping_add(1);
        Some(idx)
    }

    fn deliver_to(&mut self, idx: usize, batch: Vec<Stored>, sessions: &HashMap<String, Session>) {
        if batch.is_empty() {
            return;
        }
        let member = &self.members[idx];
        let tracks = member.tracks_acks();
        let deliveries = batch
            .iter()
            .map(|s| Delivery {
                seq: tracks.then_some(s.seq),
                reply_to: None,
                body: s.body.clone(),
            })
            .collect();
        send(sessions, member, deliveries);

        if tracks {
            let owner = member.client_id.clone();
            for stored in batch {
                self.unacked.insert(stored.seq, (owner.clone(), stored));
            }
        }
    }

    /// Gives the unacknowledged messages of a departed shared member to the
    /// remaining members, or back to the backlog.
    fn requeue_unacked_of(&mut self, client_id: &str, sessions: &HashMap<String, Session>) {
        let seqs: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (owner, _))| owner == client_id)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in seqs.into_iter().rev() {
            if let Some((_, stored)) = self.unacked.remove(&seq) {
                self.backlog.push_front(stored);
            }
        }

        while let Some(idx) = (!self.backlog.is_empty())
            .then(|| self.pick_member())
            .flatten()
        {
            if let Some(stored) = self.backlog.pop_front() {
                self.deliver_to(idx, vec![stored], sessions);
            }
        }
    }
}

fn send(sessions: &HashMap<String, Session>, member: &Member, messages: Vec<Delivery>) {
    if messages.is_empty() || !member.attached {
        return;
    }
    let Some(session) = sessions
        .get(&member.client_id)
        .filter(|s| s.token == member.token)
    else {
        return;
    };
    session.send(&ServerMessage::Deliver {
        to: Some(member.subscription_id.clone()),
        messages,
    });
}
