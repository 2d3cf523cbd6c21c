//! # eftl
//!
//! `eftl` is a messaging client runtime that talks to a message broker over a
//! single multiplexed WebSocket, together with a small reference broker that
//! speaks the same protocol.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `client`: The connection runtime: state machine with reconnect and backoff,
//!   subscriptions, publish completions, request/reply and key-value maps.
//! - `message`: The typed, self-describing message model and its JSON encoding.
//! - `matcher`: Content matchers that select messages for a subscription.
//! - `broker`: The reference broker with durable, shared and last-value subscriptions.
//! - `transport`: Protocol frames, close codes and the WebSocket server.
//! - `config`: Handles loading and managing server configuration.
//! - `persistence`: Sled-backed storage for key-value maps.
//! - `utils`: Shared error taxonomy and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod matcher;
pub mod message;
pub mod persistence;
pub mod transport;
pub mod utils;
