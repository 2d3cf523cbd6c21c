use serde::Deserialize;

/// Top-level configuration settings for the reference server.
///
/// Includes settings for the listener, the broker and authentication.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub auth: AuthSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the server will bind to and the channel path
/// advertised to clients.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub channel: String,
}

/// Configuration settings for the broker.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub max_connections: usize,
    /// Largest accepted message body in bytes, advertised at login.
    pub max_message_size: usize,
    /// Directory of the sled database holding key-value maps.
    pub data_dir: String,
}

/// Authentication settings. An empty user list admits anonymous clients.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct AuthSettings {
    #[serde(default)]
    pub users: Vec<UserSettings>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct UserSettings {
    pub username: String,
    pub password: String,
    #[serde(default = "allowed")]
    pub can_publish: bool,
    #[serde(default = "allowed")]
    pub can_subscribe: bool,
}

fn allowed() -> bool {
    true
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub auth: Option<AuthSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub channel: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub max_message_size: Option<usize>,
    pub data_dir: Option<String>,
}

impl Settings {
    /// Fills every missing value from `Settings::default()`.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let server = partial.server;
        let broker = partial.broker;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(default.server.port),
                channel: server
                    .as_ref()
                    .and_then(|s| s.channel.clone())
                    .unwrap_or(default.server.channel),
            },
            broker: BrokerSettings {
                max_connections: broker
                    .as_ref()
                    .and_then(|b| b.max_connections)
                    .unwrap_or(default.broker.max_connections),
                max_message_size: broker
                    .as_ref()
                    .and_then(|b| b.max_message_size)
                    .unwrap_or(default.broker.max_message_size),
                data_dir: broker
                    .as_ref()
                    .and_then(|b| b.data_dir.clone())
                    .unwrap_or(default.broker.data_dir),
            },
            auth: partial.auth.unwrap_or(default.auth),
        }
    }

    /// Looks up a user by credentials. `Ok(None)` means anonymous access.
    pub fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Option<&UserSettings>, ()> {
        if self.auth.users.is_empty() {
            return Ok(None);
        }
        self.auth
            .users
            .iter()
            .find(|u| Some(u.username.as_str()) == username && Some(u.password.as_str()) == password)
            .map(Some)
            .ok_or(())
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 9191,
                channel: "/channel".to_string(),
            },
            broker: BrokerSettings {
                max_connections: 1000,
                max_message_size: 8 * 1024 * 1024,
                data_dir: "eftl_db".to_string(),
            },
            auth: AuthSettings::default(),
        }
    }
}
