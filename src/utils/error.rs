//! The `error` module defines the error taxonomy used within the `eftl` crate.
//!
//! Every failure surfaced to a caller carries a numeric code from a fixed
//! taxonomy plus a human-readable reason:
//!
//! - argument errors (`InvalidArgument`, `SubscriptionInvalid`) are raised
//!   synchronously at the call site and never retried;
//! - connection errors carry a [`CloseCode`] and drive the reconnect policy;
//! - operation errors carry an [`ErrorCode`] and are scoped to a single
//!   publish, subscribe, request or map call.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::close::CloseCode;

/// Numeric codes for operation-scoped failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ErrorCode {
    InvalidArgument,
    PublishFailed,
    PublishDisallowed,
    SubscriptionDisallowed,
    SubscriptionFailed,
    SubscriptionInvalid,
    RequestFailed,
    RequestDisallowed,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::InvalidArgument => 10,
            ErrorCode::PublishFailed => 11,
            ErrorCode::PublishDisallowed => 12,
            ErrorCode::SubscriptionDisallowed => 13,
            ErrorCode::SubscriptionFailed => 21,
            ErrorCode::SubscriptionInvalid => 22,
            ErrorCode::RequestFailed => 30,
            ErrorCode::RequestDisallowed => 40,
        }
    }

    /// Whether the caller may reasonably retry the same operation.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::PublishFailed | ErrorCode::SubscriptionFailed | ErrorCode::RequestFailed
        )
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.as_u16()
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            10 => Ok(ErrorCode::InvalidArgument),
            11 => Ok(ErrorCode::PublishFailed),
            12 => Ok(ErrorCode::PublishDisallowed),
            13 => Ok(ErrorCode::SubscriptionDisallowed),
            21 => Ok(ErrorCode::SubscriptionFailed),
            22 => Ok(ErrorCode::SubscriptionInvalid),
            30 => Ok(ErrorCode::RequestFailed),
            40 => Ok(ErrorCode::RequestDisallowed),
            other => Err(format!("unknown error code {other}")),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::PublishFailed => "publish failed",
            ErrorCode::PublishDisallowed => "publish disallowed",
            ErrorCode::SubscriptionDisallowed => "subscription disallowed",
            ErrorCode::SubscriptionFailed => "subscription failed",
            ErrorCode::SubscriptionInvalid => "subscription invalid",
            ErrorCode::RequestFailed => "request failed",
            ErrorCode::RequestDisallowed => "request disallowed",
        };
        write!(f, "{name} ({})", self.as_u16())
    }
}

/// The unified error type of the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed URL, matcher, message or option. Raised at the call site.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The connection is unusable or was lost while the operation was in flight.
    #[error("connection error [{code}]: {reason}")]
    Connection { code: CloseCode, reason: String },

    /// A single operation was refused or failed on the server.
    #[error("{code}: {reason}")]
    Operation { code: ErrorCode, reason: String },

    /// Process-wide settings can only change before the first connect.
    #[error("a connection has already been established in this process")]
    AlreadyConnected,

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Storage(#[from] sled::Error),

    #[error(transparent)]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument(reason.into())
    }

    pub fn connection(code: CloseCode, reason: impl Into<String>) -> Self {
        Error::Connection {
            code,
            reason: reason.into(),
        }
    }

    pub fn operation(code: ErrorCode, reason: impl Into<String>) -> Self {
        Error::Operation {
            code,
            reason: reason.into(),
        }
    }

    /// Shorthand for the error returned when nothing can be sent.
    pub fn not_connected() -> Self {
        Error::connection(CloseCode::ConnectionError, "not connected")
    }

    /// Numeric code from the fixed taxonomy.
    pub fn code(&self) -> u16 {
        match self {
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument.as_u16(),
            Error::Connection { code, .. } => code.as_u16(),
            Error::Operation { code, .. } => code.as_u16(),
            Error::AlreadyConnected => ErrorCode::InvalidArgument.as_u16(),
            Error::Tls(_) => CloseCode::TlsHandshakeFailed.as_u16(),
            Error::Config(_) | Error::Encoding(_) => ErrorCode::InvalidArgument.as_u16(),
            Error::Storage(_) => ErrorCode::RequestFailed.as_u16(),
            Error::Io(_) | Error::WebSocket(_) => CloseCode::ConnectionError.as_u16(),
        }
    }

    /// Human-readable reason without the code prefix.
    pub fn reason(&self) -> String {
        match self {
            Error::InvalidArgument(reason) => reason.clone(),
            Error::Connection { reason, .. } | Error::Operation { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }

    /// The close code when this error ends or prevents a session.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::Connection { code, .. } => Some(*code),
            Error::Tls(_) => Some(CloseCode::TlsHandshakeFailed),
            Error::Io(_) | Error::WebSocket(_) => Some(CloseCode::ConnectionError),
            _ => None,
        }
    }

    /// Clone-like copy used when one failure is fanned out to many waiters.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Error::InvalidArgument(reason) => Error::InvalidArgument(reason.clone()),
            Error::Connection { code, reason } => Error::connection(*code, reason.clone()),
            Error::Operation { code, reason } => Error::operation(*code, reason.clone()),
            Error::AlreadyConnected => Error::AlreadyConnected,
            other => Error::connection(
                other.close_code().unwrap_or(CloseCode::ConnectionError),
                other.to_string(),
            ),
        }
    }
}
