//! WebSocket transport
//!
//! This file implements the WebSocket server that fronts the [`Broker`].
//! Responsibilities:
//! - Accept TCP/WebSocket connections on the configured channel path
//! - Enforce a login-first order: the first frame must be `login`, and a
//!   rejected login closes the socket with `NotAuthenticated`
//! - Create a [`Session`] per login and register it with the broker
//! - Serialize/deserialize JSON frames and forward them to the broker
//!
//! Each connection gets a writer task fed by an unbounded channel; the broker
//! only ever queues frames on that channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::{CloseFrame, Message as WsMessage};
use uuid::Uuid;

use crate::broker::{self, Broker, Permissions, Session};
use crate::config::Settings;
use crate::transport::close::CloseCode;
use crate::transport::message::{ClientMessage, ServerMessage, to_ws};
use crate::utils::error::Result;

/// How long a freshly upgraded socket may take to send its login frame.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(15);

pub struct WebSocketServer {
    listener: TcpListener,
    broker: Arc<Mutex<Broker>>,
    settings: Arc<Settings>,
}

impl WebSocketServer {
    pub async fn bind(addr: &str, broker: Arc<Mutex<Broker>>, settings: Settings) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            broker,
            settings: Arc::new(settings),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("WebSocket server listening on ws://{addr}{}", self.settings.server.channel);
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let broker = self.broker.clone();
                    let settings = self.settings.clone();
                    spawn(handle_connection(stream, broker, settings));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }
}

pub async fn start_websocket_server(
    addr: &str,
    broker: Arc<Mutex<Broker>>,
    settings: Settings,
) -> Result<()> {
    WebSocketServer::bind(addr, broker, settings).await?.run().await;
    Ok(())
}

struct Login {
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
}

async fn handle_connection(stream: TcpStream, broker: Arc<Mutex<Broker>>, settings: Arc<Settings>) {
    let channel = settings.server.channel.clone();
    let check_path = move |req: &Request, resp: Response| {
        if req.uri().path() == channel {
            Ok(resp)
        } else {
            let mut err = ErrorResponse::new(Some(format!("unknown channel {}", req.uri().path())));
            *err.status_mut() = StatusCode::NOT_FOUND;
            Err(err)
        }
    };

    let ws_stream = match accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let login = match timeout(LOGIN_TIMEOUT, read_login(&mut ws_receiver)).await {
        Ok(Some(login)) => login,
        Ok(None) | Err(_) => {
            warn!("connection closed or timed out before login");
            let _ = ws_sender
                .send(close_frame(CloseCode::ProtocolError, "login required"))
                .await;
            return;
        }
    };

    let (user, permissions) =
        match settings.authenticate(login.username.as_deref(), login.password.as_deref()) {
            Ok(Some(user)) => (
                Some(user.username.clone()),
                Permissions {
                    can_publish: user.can_publish,
                    can_subscribe: user.can_subscribe,
                },
            ),
            Ok(None) => (login.username.clone(), Permissions::default()),
            Err(()) => {
                warn!(user = ?login.username, "authentication failed");
                let _ = ws_sender
                    .send(close_frame(CloseCode::NotAuthenticated, "authentication failed"))
                    .await;
                return;
            }
        };

    let client_id = login
        .client_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("client-{}", Uuid::new_v4()));

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let session = Session::new(client_id.clone(), user, permissions, tx.clone());
    let token = session.token;

    let admitted = {
        let mut broker = broker::lock(&broker);
        let replacing = broker.sessions.contains_key(&client_id);
        if !replacing && broker.session_count() >= settings.broker.max_connections {
            false
        } else {
            let welcome = ServerMessage::Welcome {
                client_id: client_id.clone(),
                max_message_size: broker.max_message_size(),
            };
            match to_ws(&welcome) {
                Ok(frame) => {
                    let _ = tx.send(frame);
                }
                Err(e) => {
                    warn!("failed to encode welcome: {e}");
                    return;
                }
            }
            broker.register_session(session);
            true
        }
    };
    if !admitted {
        warn!(client = %client_id, "connection limit reached");
        let _ = ws_sender
            .send(close_frame(CloseCode::ServerError, "too many connections"))
            .await;
        return;
    }

    let cleanup_called = Arc::new(AtomicBool::new(false));

    let do_cleanup = {
        let broker = broker.clone();
        let client_id = client_id.clone();
        let cleanup_called = cleanup_called.clone();

        move || {
            if !cleanup_called.swap(true, Ordering::SeqCst) {
                broker::lock(&broker).remove_session(&client_id, token);
            }
        }
    };

    {
        let client_id = client_id.clone();
        let do_cleanup = do_cleanup.clone();

        spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = msg.is_close();
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("failed to send to {client_id}: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }

            do_cleanup();
            debug!("send loop closed for {client_id}");
        });
    }

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            WsMessage::Binary(_) => {
                warn!(client = %client_id, "ignoring binary frame");
                continue;
            }
            _ => continue,
        };

        match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(ClientMessage::Disconnect {}) => {
                debug!(client = %client_id, "disconnect requested");
                let _ = tx.send(close_frame(CloseCode::Normal, "disconnected"));
                break;
            }
            Ok(frame) => broker::lock(&broker).handle(&client_id, frame),
            Err(err) => {
                warn!(
                    "invalid client message from {client_id}: {err} | {}",
                    text.as_str().chars().take(100).collect::<String>()
                );
                if let Ok(frame) = to_ws(&ServerMessage::Error {
                    message: format!("invalid frame: {err}"),
                }) {
                    let _ = tx.send(frame);
                }
            }
        }
    }

    do_cleanup();
    info!(client = %client_id, "connection closed");
}

/// Reads frames until the first text frame, which must be a login.
async fn read_login<S>(receiver: &mut S) -> Option<Login>
where
    S: Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            WsMessage::Text(text) => {
                return match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::Login {
                        username,
                        password,
                        client_id,
                        ..
                    }) => Some(Login {
                        username,
                        password,
                        client_id,
                    }),
                    _ => None,
                };
            }
            WsMessage::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

fn close_frame(code: CloseCode, reason: &str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: code.into(),
        reason: reason.to_string().into(),
    }))
}
