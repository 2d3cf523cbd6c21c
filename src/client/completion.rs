//! Tracks publishes that asked for a completion callback.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::listener::CompletionListener;
use crate::message::Message;
use crate::utils::error::Error;

struct PendingPublish {
    message: Message,
    listener: Arc<dyn CompletionListener>,
}

/// Removing an entry before invoking its listener is what makes every
/// outcome fire exactly once.
#[derive(Default)]
pub(crate) struct CompletionTracker {
    pending: HashMap<u64, PendingPublish>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, seq: u64, message: Message, listener: Arc<dyn CompletionListener>) {
        self.pending.insert(seq, PendingPublish { message, listener });
    }

    pub fn complete(&mut self, seq: u64) {
        match self.pending.remove(&seq) {
            Some(p) => p.listener.on_completion(&p.message),
            None => debug!("ignoring ack for unknown publish {seq}"),
        }
    }

    pub fn fail(&mut self, seq: u64, code: u16, reason: &str) {
        match self.pending.remove(&seq) {
            Some(p) => p.listener.on_error(&p.message, code, reason),
            None => debug!("ignoring failure for unknown publish {seq}"),
        }
    }

    /// Fails every in-flight publish, in sequence order.
    pub fn fail_all(&mut self, err: &Error) {
        let mut drained: Vec<_> = self.pending.drain().collect();
        drained.sort_by_key(|(seq, _)| *seq);
        let reason = err.reason();
        for (_, p) in drained {
            p.listener.on_error(&p.message, err.code(), &reason);
        }
    }
}
