//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `eftl` crate.
//!
//! This module centralizes the error taxonomy shared by the client runtime and
//! the reference broker, and the logging initialisation used by the binary
//! and the tests.

pub mod error;
pub mod logging;

pub use error::{Error, ErrorCode, Result};

#[cfg(test)]
mod tests;
