//! Connect and subscription properties, and the server URL form
//! `ws(s)://[username:password@]host[:port]/channel[?clientId=<id>]`.

use std::time::Duration;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use url::Url;

use super::backoff::{DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY};
use crate::transport::message::{AckMode, DurableType};
use crate::utils::error::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Connect properties. Every field is optional; the getters apply defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub timeout_seconds: Option<f64>,
    pub notification_token: Option<String>,
    pub auto_reconnect_attempts: Option<u32>,
    pub auto_reconnect_max_delay_seconds: Option<f64>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_notification_token(mut self, token: impl Into<String>) -> Self {
        self.notification_token = Some(token.into());
        self
    }

    pub fn with_auto_reconnect(mut self, attempts: u32, max_delay: Duration) -> Self {
        self.auto_reconnect_attempts = Some(attempts);
        self.auto_reconnect_max_delay_seconds = Some(max_delay.as_secs_f64());
        self
    }

    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_seconds).unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn auto_reconnect_attempts(&self) -> u32 {
        self.auto_reconnect_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn auto_reconnect_max_delay(&self) -> Duration {
        seconds(self.auto_reconnect_max_delay_seconds).unwrap_or(DEFAULT_MAX_DELAY)
    }

    /// Rejects durations that are not positive or do not fit a `Duration`.
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: Option<f64>| match v {
            Some(secs) if secs <= 0.0 || seconds(Some(secs)).is_none() => {
                Err(Error::invalid_argument(format!(
                    "{name} must be a positive number of seconds, got {secs}"
                )))
            }
            _ => Ok(()),
        };
        positive("timeoutSeconds", self.timeout_seconds)?;
        positive(
            "autoReconnectMaxDelaySeconds",
            self.auto_reconnect_max_delay_seconds,
        )
    }

    /// Options for a manual reconnect: credentials come only from `self`,
    /// everything else falls back to the stored options.
    pub fn merged_over(&self, stored: &ConnectOptions) -> ConnectOptions {
        ConnectOptions {
            username: self.username.clone(),
            password: self.password.clone(),
            client_id: self.client_id.clone().or_else(|| stored.client_id.clone()),
            timeout_seconds: self.timeout_seconds.or(stored.timeout_seconds),
            notification_token: self
                .notification_token
                .clone()
                .or_else(|| stored.notification_token.clone()),
            auto_reconnect_attempts: self
                .auto_reconnect_attempts
                .or(stored.auto_reconnect_attempts),
            auto_reconnect_max_delay_seconds: self
                .auto_reconnect_max_delay_seconds
                .or(stored.auto_reconnect_max_delay_seconds),
        }
    }
}

fn seconds(value: Option<f64>) -> Option<Duration> {
    value.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Properties of a single subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionOptions {
    pub durable_type: Option<DurableType>,
    pub durable_key: Option<String>,
    pub ack_mode: AckMode,
}

impl SubscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Self {
        Self {
            durable_type: Some(DurableType::Shared),
            ..Self::default()
        }
    }

    pub fn last_value(key: impl Into<String>) -> Self {
        Self {
            durable_type: Some(DurableType::LastValue),
            durable_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }
}

/// A validated server URL with any embedded credentials split out.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    url: Url,
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut url =
            Url::parse(raw).map_err(|e| Error::invalid_argument(format!("bad URL '{raw}': {e}")))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::invalid_argument(format!(
                "unsupported URL scheme '{}', expected ws or wss",
                url.scheme()
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::invalid_argument("URL has no host"));
        }
        if url.path().trim_matches('/').is_empty() {
            return Err(Error::invalid_argument("URL has no channel path"));
        }

        let username = Some(decode_userinfo(url.username())?).filter(|u| !u.is_empty());
        let password = url.password().map(decode_userinfo).transpose()?;
        let client_id = url
            .query_pairs()
            .find(|(k, _)| k == "clientId")
            .map(|(_, v)| v.into_owned());

        let stripped = url.set_username("").is_ok() && url.set_password(None).is_ok();
        if !stripped {
            return Err(Error::invalid_argument("URL cannot carry credentials"));
        }
        url.set_query(None);
        url.set_fragment(None);

        Ok(Self {
            url,
            username,
            password,
            client_id,
        })
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "wss"
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Explicit port, or 80/443 from the scheme.
    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.is_secure() { 443 } else { 80 })
    }

    pub fn channel(&self) -> &str {
        self.url.path()
    }

    /// URL to dial: no credentials, no query.
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

/// Userinfo arrives percent-encoded in the URL.
fn decode_userinfo(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| Error::invalid_argument(format!("credentials are not valid UTF-8: {e}")))
}
