//! Correlates round trips (requests, map operations) with their answers.
//!
//! Each outstanding operation is a oneshot sender keyed by sequence number.
//! The first answer removes the entry; later answers for the same sequence
//! find nothing and are discarded.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::debug;

use crate::utils::error::{Error, Result};

pub(crate) type Responder<T> = oneshot::Sender<Result<T>>;

pub(crate) struct Correlator<T> {
    kind: &'static str,
    pending: HashMap<u64, Responder<T>>,
}

impl<T> Correlator<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            pending: HashMap::new(),
        }
    }

    pub fn register(&mut self, seq: u64, responder: Responder<T>) {
        self.pending.insert(seq, responder);
    }

    /// Delivers the outcome. Returns false when nothing was waiting.
    pub fn resolve(&mut self, seq: u64, outcome: Result<T>) -> bool {
        match self.pending.remove(&seq) {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!("{} {seq} resolved after its caller gave up", self.kind);
                }
                true
            }
            None => {
                debug!("discarding answer for unknown {} {seq}", self.kind);
                false
            }
        }
    }

    /// Forgets an operation whose caller timed out.
    pub fn expire(&mut self, seq: u64) {
        self.pending.remove(&seq);
    }

    pub fn fail_all(&mut self, err: &Error) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(err.duplicate()));
        }
    }
}
