//! Observable connection state.
//!
//! ```text
//! Connecting -> Connected -> Reconnecting -> Connected
//!     |             |             |
//!     v             v             v
//!   Failed     Disconnected  Disconnected
//! ```

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial connect attempt in progress.
    Connecting,
    Connected,
    /// Transport lost; attempt `attempt` starts after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Closed by the caller, by a terminal close code or after the reconnect
    /// attempts ran out.
    Disconnected,
    /// The initial connect never succeeded.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting { .. } => "Reconnecting",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Failed => "Failed",
        }
    }

    pub fn details(&self) -> String {
        match self {
            ConnectionState::Reconnecting { attempt, delay } => {
                format!("attempt {attempt} in {} seconds", delay.as_secs_f64())
            }
            _ => String::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self, ConnectionState::Reconnecting { .. })
    }

    /// No further traffic is possible without an explicit reconnect.
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}
