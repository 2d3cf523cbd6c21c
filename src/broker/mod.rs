//! Reference broker hosted by the WebSocket server.

use std::sync::{Mutex, MutexGuard};

pub mod durable;
pub mod engine;
pub mod session;

pub use durable::{Durable, DurableKind};
pub use engine::Broker;
pub use session::{Permissions, Session};

/// Locks the shared broker, recovering the state if a holder panicked.
pub fn lock(broker: &Mutex<Broker>) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
