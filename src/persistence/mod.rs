//! The `persistence` module provides the storage behind the broker's
//! key-value maps.
//!
//! It uses `sled` as an embedded key-value store: one tree per map name,
//! each value stored as the JSON encoding of the message body.

pub mod sled_store;

pub use sled_store::MapStore;

#[cfg(test)]
mod tests;
