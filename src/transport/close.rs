//! Close-code taxonomy shared by the client runtime and the broker.
//!
//! Codes travel in WebSocket close frames. Each code maps to a retry policy:
//! transient codes are eligible for automatic reconnect, terminal codes must
//! surface to the caller.

use std::fmt;

use serde::{Deserialize, Serialize};
use tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum CloseCode {
    Normal,
    Shutdown,
    ProtocolError,
    BadData,
    ConnectionError,
    BadPayload,
    PolicyViolation,
    MessageTooBig,
    ServerError,
    Restart,
    TlsHandshakeFailed,
    ForceClose,
    NotAuthenticated,
    /// Any code outside the taxonomy. Treated as terminal.
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::Shutdown => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::BadData => 1003,
            CloseCode::ConnectionError => 1006,
            CloseCode::BadPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::ServerError => 1011,
            CloseCode::Restart => 1012,
            CloseCode::TlsHandshakeFailed => 1015,
            CloseCode::ForceClose => 4000,
            CloseCode::NotAuthenticated => 4002,
            CloseCode::Other(code) => code,
        }
    }

    /// Transient codes are retried by the reconnect policy.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            CloseCode::Shutdown
                | CloseCode::ConnectionError
                | CloseCode::ServerError
                | CloseCode::Restart
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseCode::Normal => "normal",
            CloseCode::Shutdown => "shutdown",
            CloseCode::ProtocolError => "protocol error",
            CloseCode::BadData => "bad data",
            CloseCode::ConnectionError => "connection error",
            CloseCode::BadPayload => "bad payload",
            CloseCode::PolicyViolation => "policy violation",
            CloseCode::MessageTooBig => "message too big",
            CloseCode::ServerError => "server error",
            CloseCode::Restart => "restart",
            CloseCode::TlsHandshakeFailed => "TLS handshake failed",
            CloseCode::ForceClose => "force close",
            CloseCode::NotAuthenticated => "not authenticated",
            CloseCode::Other(_) => "unknown",
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Shutdown,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::BadData,
            1006 => CloseCode::ConnectionError,
            1007 => CloseCode::BadPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1011 => CloseCode::ServerError,
            1012 => CloseCode::Restart,
            1015 => CloseCode::TlsHandshakeFailed,
            4000 => CloseCode::ForceClose,
            4002 => CloseCode::NotAuthenticated,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

impl From<WsCloseCode> for CloseCode {
    fn from(code: WsCloseCode) -> Self {
        CloseCode::from(u16::from(code))
    }
}

impl From<CloseCode> for WsCloseCode {
    fn from(code: CloseCode) -> Self {
        WsCloseCode::from(code.as_u16())
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.as_u16())
    }
}
