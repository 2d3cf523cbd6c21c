//! The connection handle and the background task behind it.
//!
//! [`Connection`] is a cheap, cloneable handle. Every operation is turned
//! into a [`Command`] on an unbounded channel and executed by one background
//! task per connection. That task owns the WebSocket, the subscription table
//! and the tables of in-flight publishes, requests and map operations, and it
//! is the only place listener callbacks run.
//!
//! Dropping every handle shuts the task down and closes the socket.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tracing::{debug, info, warn};
use tungstenite::protocol::{CloseFrame, Message as WsMessage};

use super::backoff::Backoff;
use super::completion::CompletionTracker;
use super::kv::{KvMap, MapOp};
use super::listener::{CompletionListener, ConnectionListener, SubscriptionListener};
use super::options::{ConnectOptions, Endpoint, SubscriptionOptions};
use super::request::{Correlator, Responder};
use super::state::ConnectionState;
use super::subscription::{Subscription, SubscriptionManager};
use super::tls;
use crate::message::{Message, ReplyAddress, codec};
use crate::transport::close::CloseCode;
use crate::transport::message::{AckMode, ClientMessage, Delivery, ServerMessage, to_ws};
use crate::utils::error::{Error, ErrorCode, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) enum Command {
    Subscribe(Subscription),
    Unsubscribe {
        id: String,
    },
    UnsubscribeAll,
    Acknowledge {
        subscription: String,
        seq: u64,
        all: bool,
    },
    Publish {
        message: Message,
        completion: Option<Arc<dyn CompletionListener>>,
    },
    Request {
        seq: u64,
        message: Message,
        reply_tx: Responder<Message>,
    },
    ExpireRequest {
        seq: u64,
    },
    Reply {
        to: ReplyAddress,
        message: Message,
    },
    Map {
        seq: u64,
        map: String,
        op: MapOp,
        reply_tx: Responder<Option<Message>>,
    },
    ExpireMap {
        seq: u64,
    },
    /// A frame queued while reconnecting that no longer has local state.
    Forward(ClientMessage),
    Disconnect,
    Reconnect {
        options: ConnectOptions,
    },
}

/// State visible to every handle without a round trip through the task.
pub(crate) struct Shared {
    state: watch::Receiver<ConnectionState>,
    client_id: Mutex<Option<String>>,
    /// 0 until the server advertised a limit.
    max_message_size: AtomicUsize,
    next_seq: AtomicU64,
    timeout_millis: AtomicU64,
}

impl Shared {
    fn client_id(&self) -> Option<String> {
        self.client_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_client_id(&self, client_id: String) {
        *self.client_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(client_id);
    }

    fn set_timeout(&self, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.timeout_millis.store(millis, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl Connection {
    /// Connects to `url` and resolves once the initial attempt has finished.
    ///
    /// On failure the listener's `on_disconnect` fires as well and the error
    /// carries the close code.
    pub async fn connect<L>(url: &str, options: ConnectOptions, listener: L) -> Result<Connection>
    where
        L: ConnectionListener + 'static,
    {
        Self::connect_with(url, options, Arc::new(listener)).await
    }

    pub async fn connect_with(
        url: &str,
        options: ConnectOptions,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<Connection> {
        let endpoint = Endpoint::parse(url)?;
        options.validate()?;
        tls::mark_connected();

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: state_rx,
            client_id: Mutex::new(None),
            max_message_size: AtomicUsize::new(0),
            next_seq: AtomicU64::new(1),
            timeout_millis: AtomicU64::new(0),
        });
        shared.set_timeout(options.timeout());

        let connection = Connection {
            cmd_tx: cmd_tx.clone(),
            shared: shared.clone(),
        };

        let actor = Actor {
            backoff: Backoff::new(
                options.auto_reconnect_attempts(),
                options.auto_reconnect_max_delay(),
            ),
            endpoint,
            options,
            listener,
            shared,
            state_tx,
            cmd_tx: cmd_tx.downgrade(),
            ws: None,
            reconnect_at: None,
            subscriptions: SubscriptionManager::new(),
            completions: CompletionTracker::new(),
            requests: Correlator::new("request"),
            maps: Correlator::new("map operation"),
            queued: VecDeque::new(),
        };
        drop(cmd_tx);

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(actor.run(cmd_rx, ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(connection),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::not_connected()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.borrow().is_connected()
    }

    /// Client id assigned (or confirmed) by the server at login.
    pub fn client_id(&self) -> Option<String> {
        self.shared.client_id()
    }

    /// Largest message body the server accepts, once known.
    pub fn max_message_size(&self) -> Option<usize> {
        match self.shared.max_message_size.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }

    /// Subscribes to messages accepted by `matcher` and returns the
    /// subscription id.
    pub fn subscribe<L>(&self, matcher: &str, listener: L) -> Result<String>
    where
        L: SubscriptionListener + 'static,
    {
        self.subscribe_with(matcher, None, SubscriptionOptions::default(), Arc::new(listener))
    }

    pub fn subscribe_durable<L>(
        &self,
        matcher: &str,
        durable: &str,
        options: SubscriptionOptions,
        listener: L,
    ) -> Result<String>
    where
        L: SubscriptionListener + 'static,
    {
        self.subscribe_with(matcher, Some(durable), options, Arc::new(listener))
    }

    pub fn subscribe_with(
        &self,
        matcher: &str,
        durable: Option<&str>,
        options: SubscriptionOptions,
        listener: Arc<dyn SubscriptionListener>,
    ) -> Result<String> {
        let subscription =
            Subscription::prepare(self.next_seq(), matcher, durable, options, listener)?;
        self.ensure_open()?;
        let id = subscription.id.clone();
        self.send(Command::Subscribe(subscription))?;
        Ok(id)
    }

    /// Removes a subscription. For a durable this also drops the durable
    /// state on the server.
    pub fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.send(Command::Unsubscribe {
            id: subscription_id.to_string(),
        })
    }

    pub fn unsubscribe_all(&self) -> Result<()> {
        self.send(Command::UnsubscribeAll)
    }

    /// Acknowledges one message of a client-acknowledged durable. A no-op for
    /// messages the server does not track.
    pub fn acknowledge(&self, message: &Message) -> Result<()> {
        self.ack(message, false)
    }

    /// Acknowledges `message` and everything delivered before it on the same
    /// subscription.
    pub fn acknowledge_all(&self, message: &Message) -> Result<()> {
        self.ack(message, true)
    }

    fn ack(&self, message: &Message, all: bool) -> Result<()> {
        let Some(tag) = message.delivery() else {
            return Ok(());
        };
        self.send(Command::Acknowledge {
            subscription: tag.subscription.clone(),
            seq: tag.seq,
            all,
        })
    }

    /// Fire-and-forget publish.
    pub fn publish(&self, message: Message) -> Result<()> {
        self.ensure_open()?;
        self.check_size(&message)?;
        self.send(Command::Publish {
            message,
            completion: None,
        })
    }

    /// Publish whose outcome is reported to `listener`, exactly once.
    pub fn publish_with_completion<L>(&self, message: Message, listener: L) -> Result<()>
    where
        L: CompletionListener + 'static,
    {
        self.ensure_open()?;
        self.check_size(&message)?;
        self.send(Command::Publish {
            message,
            completion: Some(Arc::new(listener)),
        })
    }

    /// Sends a request and waits for its reply.
    ///
    /// `Ok(None)` means no reply arrived within `timeout`; that is an expected
    /// outcome, not an error.
    pub async fn send_request(&self, message: Message, timeout: Duration) -> Result<Option<Message>> {
        self.ensure_open()?;
        self.check_size(&message)?;

        let seq = self.next_seq();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Request {
            seq,
            message,
            reply_tx,
        })?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome.map(Some),
            Ok(Err(_)) => Err(Error::not_connected()),
            Err(_) => {
                debug!(seq, "request timed out");
                let _ = self.cmd_tx.send(Command::ExpireRequest { seq });
                Ok(None)
            }
        }
    }

    /// Replies to a message that was delivered as a request.
    pub fn send_reply(&self, reply: Message, request: &Message) -> Result<()> {
        let to = request
            .reply_to()
            .cloned()
            .ok_or_else(|| Error::invalid_argument("message was not delivered as a request"))?;
        self.ensure_open()?;
        self.check_size(&reply)?;
        self.send(Command::Reply { to, message: reply })
    }

    pub fn map(&self, name: &str) -> Result<KvMap> {
        KvMap::new(self.clone(), name)
    }

    /// Closes the connection with a normal close code. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    /// Reconnects a disconnected connection. Credentials must be supplied
    /// again; every other stored property persists unless overridden.
    pub fn reconnect(&self, options: ConnectOptions) -> Result<()> {
        options.validate()?;
        self.send(Command::Reconnect { options })
    }

    pub(crate) async fn map_operation(&self, map: &str, op: MapOp) -> Result<Option<Message>> {
        self.ensure_open()?;

        let seq = self.next_seq();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Map {
            seq,
            map: map.to_string(),
            op,
            reply_tx,
        })?;

        let deadline = Duration::from_millis(self.shared.timeout_millis.load(Ordering::Relaxed));
        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::not_connected()),
            Err(_) => {
                let _ = self.cmd_tx.send(Command::ExpireMap { seq });
                Err(Error::operation(
                    ErrorCode::RequestFailed,
                    format!("map operation timed out after {deadline:?}"),
                ))
            }
        }
    }

    pub(crate) fn check_size(&self, message: &Message) -> Result<()> {
        if let Some(max) = self.max_message_size() {
            let len = message.encoded_len();
            if len > max {
                return Err(Error::invalid_argument(format!(
                    "message of {len} bytes exceeds the server maximum of {max}"
                )));
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.state.borrow().is_closed() {
            return Err(Error::not_connected());
        }
        Ok(())
    }

    fn next_seq(&self) -> u64 {
        self.shared.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx.send(command).map_err(|_| Error::not_connected())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id())
            .field("state", &self.state())
            .finish()
    }
}

enum Event {
    Command(Command),
    Frame(Option<std::result::Result<WsMessage, tungstenite::Error>>),
    ReconnectDue,
    /// Every handle is gone.
    Shutdown,
}

struct Actor {
    endpoint: Endpoint,
    options: ConnectOptions,
    listener: Arc<dyn ConnectionListener>,
    shared: Arc<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
    ws: Option<WsStream>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    subscriptions: SubscriptionManager,
    completions: CompletionTracker,
    requests: Correlator<Message>,
    maps: Correlator<Option<Message>>,
    /// Work issued while reconnecting, flushed once connected again.
    queued: VecDeque<Command>,
}

impl Actor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        match establish(&self.endpoint, &self.options, &self.shared).await {
            Ok(ws) => {
                self.ws = Some(ws);
                self.set_state(ConnectionState::Connected);
                info!(url = self.endpoint.as_str(), client_id = ?self.shared.client_id(), "connected");
                let listener = self.listener.clone();
                self.notify(|c| listener.on_connect(c));
                let _ = ready.send(Ok(()));
            }
            Err(err) => {
                let code = err.close_code().unwrap_or(CloseCode::ConnectionError);
                warn!(url = self.endpoint.as_str(), %code, "connect failed: {}", err.reason());
                self.set_state(ConnectionState::Failed);
                let listener = self.listener.clone();
                let reason = err.reason();
                self.notify(|c| listener.on_disconnect(c, code, &reason));
                let _ = ready.send(Err(err));
            }
        }

        loop {
            match self.next_event(&mut cmd_rx).await {
                Event::Command(Command::Disconnect) => self.disconnect_requested().await,
                Event::Command(Command::Reconnect { options }) => {
                    self.manual_reconnect(options).await
                }
                Event::Command(command) => self.submit(command).await,
                Event::Frame(frame) => self.handle_frame(frame).await,
                Event::ReconnectDue => self.attempt_reconnect().await,
                Event::Shutdown => break,
            }
        }

        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(Some(close_frame(CloseCode::Normal, "client dropped"))).await;
        }
        self.set_state(ConnectionState::Disconnected);
        debug!("connection task finished");
    }

    async fn next_event(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) -> Event {
        let command = |c: Option<Command>| c.map_or(Event::Shutdown, Event::Command);

        if let Some(ws) = self.ws.as_mut() {
            tokio::select! {
                c = cmd_rx.recv() => command(c),
                frame = ws.next() => Event::Frame(frame),
            }
        } else if let Some(at) = self.reconnect_at {
            tokio::select! {
                c = cmd_rx.recv() => command(c),
                _ = sleep_until(at) => Event::ReconnectDue,
            }
        } else {
            command(cmd_rx.recv().await)
        }
    }

    /// Builds a temporary handle and passes it to a callback. Skipped when
    /// every user handle is gone.
    fn notify(&self, callback: impl FnOnce(&Connection)) {
        if let Some(cmd_tx) = self.cmd_tx.upgrade() {
            let connection = Connection {
                cmd_tx,
                shared: self.shared.clone(),
            };
            callback(&connection);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(%state, "state change");
        self.state_tx.send_replace(state);
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn apply_options(&mut self, options: ConnectOptions) {
        self.backoff
            .set_max_attempts(options.auto_reconnect_attempts());
        self.backoff.set_max_delay(options.auto_reconnect_max_delay());
        self.shared.set_timeout(options.timeout());
        self.options = options;
    }

    async fn attempt_reconnect(&mut self) {
        self.reconnect_at = None;
        info!(attempt = self.backoff.attempt(), "reconnect attempt");
        match establish(&self.endpoint, &self.options, &self.shared).await {
            Ok(ws) => self.on_reconnected(ws).await,
            Err(err) => {
                let code = err.close_code().unwrap_or(CloseCode::ConnectionError);
                if code.is_retryable() {
                    self.schedule_reconnect(code, err.reason());
                } else {
                    self.enter_disconnected(code, err.reason());
                }
            }
        }
    }

    async fn manual_reconnect(&mut self, options: ConnectOptions) {
        if self.ws.is_some() {
            debug!("reconnect ignored: already connected");
            return;
        }

        let merged = options.merged_over(&self.options);
        self.apply_options(merged);
        self.reconnect_at = None;
        self.backoff.reset();
        self.set_state(ConnectionState::Connecting);

        match establish(&self.endpoint, &self.options, &self.shared).await {
            Ok(ws) => self.on_reconnected(ws).await,
            Err(err) => {
                let code = err.close_code().unwrap_or(CloseCode::ConnectionError);
                self.enter_disconnected(code, err.reason());
            }
        }
    }

    async fn on_reconnected(&mut self, ws: WsStream) {
        self.ws = Some(ws);
        self.backoff.reset();
        self.set_state(ConnectionState::Connected);
        info!(client_id = ?self.shared.client_id(), "reconnected");

        for frame in self.subscriptions.resubscribe_frames() {
            if !self.send_frame(&frame).await {
                return;
            }
        }

        let queued: Vec<Command> = self.queued.drain(..).collect();
        for command in queued {
            self.submit(command).await;
        }

        let listener = self.listener.clone();
        self.notify(|c| listener.on_reconnect(c));
    }

    // ----- connection loss -----

    fn transport_lost(&mut self, code: CloseCode, reason: String) {
        self.ws = None;
        warn!(%code, "connection lost: {reason}");

        self.fail_in_flight(&Error::connection(code, reason.clone()));
        self.subscriptions.mark_all_pending();

        if code.is_retryable() {
            self.schedule_reconnect(code, reason);
        } else {
            self.enter_disconnected(code, reason);
        }
    }

    fn schedule_reconnect(&mut self, code: CloseCode, reason: String) {
        match self.backoff.next_sleep() {
            Ok((attempt, delay)) => {
                info!(attempt, delay_secs = delay.as_secs_f64(), "scheduling reconnect");
                self.reconnect_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Reconnecting { attempt, delay });
            }
            Err(e) => {
                warn!("{e}");
                self.enter_disconnected(code, reason);
            }
        }
    }

    /// Terminal transition. Fires exactly one `on_disconnect`.
    fn enter_disconnected(&mut self, code: CloseCode, reason: String) {
        self.reconnect_at = None;
        self.backoff.reset();
        self.fail_queued(&Error::connection(code, reason.clone()));
        self.set_state(ConnectionState::Disconnected);

        let listener = self.listener.clone();
        self.notify(|c| listener.on_disconnect(c, code, &reason));
    }

    async fn disconnect_requested(&mut self) {
        let previous = self.state();
        if previous == ConnectionState::Disconnected {
            debug!("disconnect ignored: already disconnected");
            return;
        }

        if let Some(mut ws) = self.ws.take() {
            if let Ok(frame) = to_ws(&ClientMessage::Disconnect {}) {
                let _ = ws.send(frame).await;
            }
            let _ = ws.close(Some(close_frame(CloseCode::Normal, "disconnect"))).await;
        }

        let reason = "disconnected by the application".to_string();
        let err = Error::connection(CloseCode::Normal, reason.clone());
        self.fail_in_flight(&err);
        self.fail_queued(&err);
        self.subscriptions.clear();
        self.reconnect_at = None;
        self.backoff.reset();
        self.set_state(ConnectionState::Disconnected);
        info!("disconnected");

        if previous != ConnectionState::Failed {
            let listener = self.listener.clone();
            self.notify(|c| listener.on_disconnect(c, CloseCode::Normal, &reason));
        }
    }

    fn fail_in_flight(&mut self, err: &Error) {
        self.completions.fail_all(err);
        self.requests.fail_all(err);
        self.maps.fail_all(err);
    }

    fn fail_queued(&mut self, err: &Error) {
        for command in self.queued.drain(..) {
            reject(command, err);
        }
    }

    // ----- commands -----

    /// Runs a data command according to the current state: executed when
    /// connected, queued while reconnecting, rejected once closed.
    async fn submit(&mut self, command: Command) {
        match command {
            Command::ExpireRequest { seq } => {
                self.requests.expire(seq);
                self.queued
                    .retain(|c| !matches!(c, Command::Request { seq: s, .. } if *s == seq));
                return;
            }
            Command::ExpireMap { seq } => {
                self.maps.expire(seq);
                self.queued
                    .retain(|c| !matches!(c, Command::Map { seq: s, .. } if *s == seq));
                return;
            }
            Command::Subscribe(subscription) => return self.add_subscription(subscription).await,
            Command::Unsubscribe { id } => return self.remove_subscription(&id).await,
            Command::UnsubscribeAll => {
                for id in self.subscriptions.ids() {
                    self.remove_subscription(&id).await;
                }
                return;
            }
            _ => {}
        }

        if self.ws.is_some() {
            self.execute(command).await;
        } else if self.state().is_reconnecting() {
            match command {
                // The server redelivers whatever stays unacknowledged.
                Command::Acknowledge { .. } => {}
                other => self.queued.push_back(other),
            }
        } else {
            reject(command, &Error::not_connected());
        }
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Acknowledge {
                subscription,
                seq,
                all,
            } => {
                self.send_frame(&ClientMessage::Ack {
                    id: subscription,
                    seq,
                    cumulative: all,
                })
                .await;
            }
            Command::Publish {
                message,
                completion,
            } => {
                let body = codec::encode(&message);
                let seq = completion.map(|listener| {
                    let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
                    self.completions.register(seq, message, listener);
                    seq
                });
                self.send_frame(&ClientMessage::Publish { seq, body }).await;
            }
            Command::Request {
                seq,
                message,
                reply_tx,
            } => {
                if reply_tx.is_closed() {
                    return;
                }
                self.requests.register(seq, reply_tx);
                let body = codec::encode(&message);
                self.send_frame(&ClientMessage::Request { seq, body }).await;
            }
            Command::Reply { to, message } => {
                let body = codec::encode(&message);
                self.send_frame(&ClientMessage::Reply { to, body }).await;
            }
            Command::Map {
                seq,
                map,
                op,
                reply_tx,
            } => {
                if reply_tx.is_closed() {
                    return;
                }
                self.maps.register(seq, reply_tx);
                self.send_frame(&op.into_frame(seq, map)).await;
            }
            Command::Forward(frame) => {
                self.send_frame(&frame).await;
            }
            _ => debug!("command not executable here"),
        }
    }

    async fn add_subscription(&mut self, subscription: Subscription) {
        let id = subscription.id.clone();
        let listener = subscription.listener.clone();

        if self.state().is_closed() {
            let err = Error::not_connected();
            self.notify(|c| listener.on_error(c, &id, err.code(), &err.reason()));
            return;
        }

        let frame = subscription.subscribe_frame();
        if let Err(err) = self.subscriptions.insert(subscription) {
            warn!(subscription = %id, "{err}");
            self.notify(|c| listener.on_error(c, &id, err.code(), &err.reason()));
            return;
        }
        debug!(subscription = %id, "subscribing");

        // While reconnecting the subscription goes out with the resubscribe pass.
        if self.ws.is_some() {
            self.send_frame(&frame).await;
        }
    }

    async fn remove_subscription(&mut self, id: &str) {
        if self.subscriptions.remove(id).is_none() {
            debug!(subscription = %id, "unsubscribe of unknown subscription");
            return;
        }
        let frame = ClientMessage::Unsubscribe { id: id.to_string() };
        if self.ws.is_some() {
            self.send_frame(&frame).await;
        } else if self.state().is_reconnecting() {
            self.queued.push_back(Command::Forward(frame));
        }
    }

    /// Returns false when the transport failed and the loss was handled.
    async fn send_frame(&mut self, frame: &ClientMessage) -> bool {
        let Some(ws) = self.ws.as_mut() else {
            return false;
        };
        let message = match to_ws(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("failed to encode frame: {e}");
                return true;
            }
        };
        if let Err(e) = ws.send(message).await {
            self.transport_lost(CloseCode::ConnectionError, e.to_string());
            return false;
        }
        true
    }

    // ----- inbound frames -----

    async fn handle_frame(
        &mut self,
        frame: Option<std::result::Result<WsMessage, tungstenite::Error>>,
    ) {
        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(message) => self.dispatch(message).await,
                    Err(e) => warn!("invalid server frame: {e}"),
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                let (code, reason) = close_details(frame);
                self.transport_lost(code, reason);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => self.transport_lost(CloseCode::ConnectionError, e.to_string()),
            None => self.transport_lost(CloseCode::ConnectionError, "connection closed".into()),
        }
    }

    async fn dispatch(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { .. } => debug!("ignoring repeated welcome"),
            ServerMessage::Subscribed { id } => {
                if let Some(listener) = self.subscriptions.activate(&id) {
                    debug!(subscription = %id, "subscribed");
                    self.notify(|c| listener.on_subscribe(c, &id));
                }
            }
            ServerMessage::SubscriptionError { id, code, reason } => {
                if let Some(sub) = self.subscriptions.fail(&id) {
                    warn!(subscription = %id, %code, "subscription failed: {reason}");
                    self.notify(|c| sub.listener.on_error(c, &id, code.as_u16(), &reason));
                }
            }
            ServerMessage::Deliver { to, messages } => self.deliver(to, messages).await,
            ServerMessage::PublishAck { seq } => self.completions.complete(seq),
            ServerMessage::PublishError { seq, code, reason } => {
                self.completions.fail(seq, code.as_u16(), &reason)
            }
            ServerMessage::Reply { seq, body } => {
                self.requests.resolve(seq, codec::decode(&body));
            }
            ServerMessage::RequestError { seq, code, reason } => {
                self.requests.resolve(seq, Err(Error::operation(code, reason)));
            }
            ServerMessage::MapResult { seq, value } => {
                self.maps
                    .resolve(seq, value.as_ref().map(codec::decode).transpose());
            }
            ServerMessage::MapError { seq, code, reason } => {
                self.maps.resolve(seq, Err(Error::operation(code, reason)));
            }
            ServerMessage::Error { message } => {
                warn!("server error: {message}");
                let listener = self.listener.clone();
                self.notify(|c| {
                    listener.on_error(c, ErrorCode::InvalidArgument.as_u16(), &message)
                });
            }
        }
    }

    async fn deliver(&mut self, to: Option<String>, deliveries: Vec<Delivery>) {
        for dispatch in self.subscriptions.route(to.as_deref(), deliveries) {
            self.notify(|c| dispatch.listener.on_messages(c, &dispatch.messages));

            if dispatch.ack_mode == AckMode::Auto {
                if let Some(seq) = dispatch.last_seq() {
                    let ack = ClientMessage::Ack {
                        id: dispatch.subscription.clone(),
                        seq,
                        cumulative: true,
                    };
                    self.send_frame(&ack).await;
                }
            }
        }
    }
}

async fn establish(
    endpoint: &Endpoint,
    options: &ConnectOptions,
    shared: &Shared,
) -> Result<WsStream> {
    let limit = options.timeout();
    match tokio::time::timeout(limit, handshake(endpoint, options, shared)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::connection(
            CloseCode::ConnectionError,
            format!("connect timed out after {} seconds", limit.as_secs_f64()),
        )),
    }
}

/// Opens the socket, logs in and waits for the welcome frame.
async fn handshake(
    endpoint: &Endpoint,
    options: &ConnectOptions,
    shared: &Shared,
) -> Result<WsStream> {
    let connector = if endpoint.is_secure() {
        Some(tls::connector()?)
    } else {
        None
    };

    let (mut ws, _) = connect_async_tls_with_config(endpoint.as_str(), None, false, connector)
        .await
        .map_err(transport_error)?;

    let login = ClientMessage::Login {
        username: options
            .username
            .clone()
            .or_else(|| endpoint.username().map(str::to_string)),
        password: options
            .password
            .clone()
            .or_else(|| endpoint.password().map(str::to_string)),
        client_id: options
            .client_id
            .clone()
            .or_else(|| shared.client_id())
            .or_else(|| endpoint.client_id().map(str::to_string)),
        notification_token: options.notification_token.clone(),
    };
    ws.send(to_ws(&login)?).await.map_err(transport_error)?;

    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                match serde_json::from_str::<ServerMessage>(text.as_str())? {
                    ServerMessage::Welcome {
                        client_id,
                        max_message_size,
                    } => {
                        shared.set_client_id(client_id);
                        shared
                            .max_message_size
                            .store(max_message_size, Ordering::Relaxed);
                        return Ok(ws);
                    }
                    other => debug!("ignoring {other:?} before welcome"),
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                let (code, reason) = close_details(frame);
                return Err(Error::connection(code, reason));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(transport_error(e)),
            None => {
                return Err(Error::connection(
                    CloseCode::ConnectionError,
                    "connection closed during login",
                ));
            }
        }
    }
}

/// Fails a command that can no longer be executed.
fn reject(command: Command, err: &Error) {
    match command {
        Command::Publish {
            message,
            completion: Some(listener),
        } => listener.on_error(&message, err.code(), &err.reason()),
        Command::Publish { .. } | Command::Reply { .. } => {
            warn!("dropping outbound message: {}", err.reason())
        }
        Command::Request { reply_tx, .. } => {
            let _ = reply_tx.send(Err(err.duplicate()));
        }
        Command::Map { reply_tx, .. } => {
            let _ = reply_tx.send(Err(err.duplicate()));
        }
        _ => {}
    }
}

fn transport_error(err: tungstenite::Error) -> Error {
    let code = match &err {
        tungstenite::Error::Tls(_) => CloseCode::TlsHandshakeFailed,
        _ => CloseCode::ConnectionError,
    };
    Error::connection(code, err.to_string())
}

fn close_details(frame: Option<CloseFrame>) -> (CloseCode, String) {
    match frame {
        Some(frame) => (CloseCode::from(frame.code), frame.reason.to_string()),
        None => (
            CloseCode::ConnectionError,
            "closed without a status code".to_string(),
        ),
    }
}

fn close_frame(code: CloseCode, reason: &str) -> CloseFrame {
    CloseFrame {
        code: code.into(),
        reason: reason.to_string().into(),
    }
}
