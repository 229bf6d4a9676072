//! Gateway RPC client: connect handshake, request/response correlation, event fan-out,
//! and reconnect with backoff.
//!
//! A single driver task owns the connection state, the pending-request table, the backoff
//! and the current transport session. [`GatewayClient`] handles talk to it over a command
//! channel; transport sessions talk to it over a signal channel. Everything the driver
//! does happens in arrival order on that one task.
//!
//! The handshake request (id `"connect"`) is sent as soon as the socket opens. Until its
//! response arrives with `ok: true`, [`GatewayClient::is_connected`] is false and
//! [`GatewayClient::request`] fails with [`ClientError::NotConnected`]. A rejected
//! handshake closes the socket so the ordinary reconnect path takes over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::backoff::{Backoff, DEFAULT_MAX_DELAY, DEFAULT_MIN_DELAY};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::protocol::{
    parse_frame, ConnectParams, ErrorInfo, EventFrame, Frame, HelloOk, ResponseFrame,
    CONNECT_METHOD, HANDSHAKE_ID,
};
use crate::transport::{
    Connector, SessionEvent, SessionHandle, SessionSignals, TransportSignal, WsConnector,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, never started.
    Idle,
    /// Opening a socket, or waiting out a reconnect delay.
    Connecting,
    /// Socket open, `connect` sent, response pending.
    AwaitingHandshake,
    /// Handshake accepted; requests may be sent.
    Ready,
    /// Stopped. Only `start()` leaves this state.
    Closed,
}

type OpenCallback = Box<dyn FnMut() + Send>;
type CloseCallback = Box<dyn FnMut(u16, &str) + Send>;
type EventCallback = Box<dyn FnMut(&EventFrame) + Send>;

#[derive(Default)]
struct Callbacks {
    on_open: Option<OpenCallback>,
    on_close: Option<CloseCallback>,
    on_event: Option<EventCallback>,
}

type Reply = oneshot::Sender<Result<Value, ClientError>>;

enum Command {
    Start,
    Stop,
    Nudge,
    Request {
        id: String,
        method: String,
        params: Option<Value>,
        reply: Reply,
    },
}

/// State published to handles. `active` is the reconnect flag: cleared by `stop()`,
/// set by `start()`. Published state changes happen under its lock so a `stop()`
/// can never be overtaken by a late promotion to `Ready`.
struct Status {
    active: Mutex<bool>,
    state: watch::Sender<ConnectionState>,
    connected: watch::Sender<bool>,
    hello: Mutex<Option<HelloOk>>,
    events: broadcast::Sender<EventFrame>,
}

impl Status {
    fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (connected, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            active: Mutex::new(false),
            state,
            connected,
            hello: Mutex::new(None),
            events,
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, bool> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_active(&self) -> bool {
        *self.lock_active()
    }

    fn set_active(&self, active: bool) {
        let mut guard = self.lock_active();
        *guard = active;
        if !active {
            self.state.send_replace(ConnectionState::Closed);
            self.connected.send_replace(false);
        }
    }

    /// Publishes `state` unless the client was stopped in the meantime; only `Closed`
    /// is published for a stopped client. Returns whether it was published.
    fn publish(&self, state: ConnectionState) -> bool {
        let guard = self.lock_active();
        if !*guard && state != ConnectionState::Closed {
            return false;
        }
        self.state.send_replace(state);
        self.connected.send_replace(state == ConnectionState::Ready);
        true
    }

    fn set_hello(&self, hello: Option<HelloOk>) {
        *self.hello.lock().unwrap_or_else(|e| e.into_inner()) = hello;
    }
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<Status>,
    next_id: AtomicU64,
}

/// Handle to a gateway client. Cheap to clone; dropping the last handle stops the client.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("state", &self.state())
            .finish()
    }
}

/// Builds a [`GatewayClient`]. `build()` spawns the driver task and needs a tokio runtime.
pub struct ClientBuilder {
    url: String,
    params: ConnectParams,
    min_delay: Duration,
    max_delay: Duration,
    connector: Arc<dyn Connector>,
    callbacks: Callbacks,
}

impl ClientBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: ConnectParams::default(),
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            connector: Arc::new(WsConnector),
            callbacks: Callbacks::default(),
        }
    }

    /// URL, token, identity and reconnect bounds from a loaded config.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.url.clone())
            .connect_params(config.connect_params())
            .min_delay(config.reconnect.min_delay())
            .max_delay(config.reconnect.max_delay())
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Opaque token placed in `connect.params.auth.token`.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.params.auth.token = Some(token.into());
        self
    }

    /// Replaces the whole handshake payload, token included.
    pub fn connect_params(mut self, params: ConnectParams) -> Self {
        self.params = params;
        self
    }

    pub fn min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Fires after every accepted handshake: the point where callers should resync state.
    pub fn on_open(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.callbacks.on_open = Some(Box::new(f));
        self
    }

    /// Fires with the close code and reason on every unexpected close.
    pub fn on_close(mut self, f: impl FnMut(u16, &str) + Send + 'static) -> Self {
        self.callbacks.on_close = Some(Box::new(f));
        self
    }

    /// Fires for every event frame, in arrival order.
    pub fn on_event(mut self, f: impl FnMut(&EventFrame) + Send + 'static) -> Self {
        self.callbacks.on_event = Some(Box::new(f));
        self
    }

    pub fn build(self) -> GatewayClient {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let status = Arc::new(Status::new());

        let driver = Driver {
            url: self.url,
            params: self.params,
            connector: self.connector,
            callbacks: self.callbacks,
            status: Arc::clone(&status),
            state: ConnectionState::Idle,
            session: None,
            session_seq: 0,
            signals_tx,
            pending: HashMap::new(),
            backoff: Backoff::new(self.min_delay, self.max_delay),
            retry_at: None,
        };
        tokio::spawn(driver.run(commands_rx, signals_rx));

        GatewayClient {
            inner: Arc::new(Inner {
                commands: commands_tx,
                status,
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl GatewayClient {
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    /// Begins (or resumes) the connection lifecycle and resets the backoff.
    /// While an attempt is already underway this only resets the backoff.
    pub fn start(&self) {
        self.inner.status.set_active(true);
        self.send(Command::Start);
    }

    /// Stops reconnecting, closes the socket and fails every outstanding request with
    /// [`ClientError::Stopped`]. `is_connected()` is false as soon as this returns.
    pub fn stop(&self) {
        self.inner.status.set_active(false);
        self.send(Command::Stop);
    }

    /// Skips the remaining reconnect delay, if the client is waiting on one.
    pub fn nudge(&self) {
        self.send(Command::Nudge);
    }

    /// Sends `method` and resolves with the response payload (`null` if it had none).
    ///
    /// Fails immediately with [`ClientError::NotConnected`] unless the handshake has
    /// completed; nothing is queued. There is no timeout: race the future against a
    /// timer if one is needed.
    pub async fn request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let id = (self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Request {
                id,
                method: method.into(),
                params,
                reply,
            })
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)?
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.status.connected.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.status.state.borrow()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.inner.status.connected.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.status.state.subscribe()
    }

    /// Event frames from now on. Slow receivers lag and lose the oldest frames.
    pub fn subscribe(&self) -> broadcast::Receiver<EventFrame> {
        self.inner.status.events.subscribe()
    }

    /// Payload of the last accepted handshake, while that connection is up.
    pub fn hello(&self) -> Option<HelloOk> {
        self.inner
            .status
            .hello
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Waits until the handshake has completed, nudging a pending reconnect first.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut rx = self.watch_connected();
        if *rx.borrow_and_update() {
            return Ok(());
        }
        self.nudge();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|connected| *connected).await.map(|_| ())
        })
        .await;
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::Stopped),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// [`wait_until_connected`](Self::wait_until_connected) followed by [`request`](Self::request).
    pub async fn request_when_ready(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        self.wait_until_connected(timeout).await?;
        self.request(method, params).await
    }

    fn send(&self, command: Command) {
        if self.inner.commands.send(command).is_err() {
            log::debug!("gateway client driver has exited");
        }
    }
}

struct Driver {
    url: String,
    params: ConnectParams,
    connector: Arc<dyn Connector>,
    callbacks: Callbacks,
    status: Arc<Status>,
    state: ConnectionState,
    session: Option<SessionHandle>,
    session_seq: u64,
    signals_tx: mpsc::UnboundedSender<SessionEvent>,
    pending: HashMap<String, Reply>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                biased;

                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = signals.recv() => self.handle_signal(event),
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.open_session();
                }
            }
        }
        log::debug!("gateway client driver exited");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => {
                self.backoff.reset();
                self.retry_at = None;
                if self.session.is_some() {
                    log::debug!("start: connection attempt already underway");
                } else {
                    self.open_session();
                }
            }
            Command::Stop => self.shutdown(),
            Command::Nudge => {
                if self.session.is_none() && self.retry_at.is_some() {
                    log::debug!("nudge: skipping reconnect delay");
                    self.open_session();
                }
            }
            Command::Request {
                id,
                method,
                params,
                reply,
            } => self.send_request(id, method, params, reply),
        }
    }

    fn send_request(&mut self, id: String, method: String, params: Option<Value>, reply: Reply) {
        let session = match &self.session {
            Some(session) if self.state == ConnectionState::Ready && self.status.is_active() => {
                session
            }
            _ => {
                let _ = reply.send(Err(ClientError::NotConnected));
                return;
            }
        };
        let text = match Frame::request(id.clone(), method, params).to_text() {
            Ok(text) => text,
            Err(e) => {
                let _ = reply.send(Err(ClientError::Json(e)));
                return;
            }
        };
        if let Err(e) = session.send(text) {
            let _ = reply.send(Err(e));
            return;
        }
        self.pending.insert(id, reply);
    }

    fn handle_signal(&mut self, event: SessionEvent) {
        if self.session.as_ref().map(SessionHandle::id) != Some(event.session) {
            log::debug!("dropping signal from stale session {}", event.session);
            return;
        }
        match event.signal {
            TransportSignal::Open => self.on_transport_open(),
            TransportSignal::Message(text) => self.on_message(&text),
            TransportSignal::Error(detail) => log::debug!("gateway transport error: {}", detail),
            TransportSignal::Closed { code, reason } => self.on_transport_closed(code, reason),
        }
    }

    fn on_transport_open(&mut self) {
        self.backoff.reset();
        self.set_state(ConnectionState::AwaitingHandshake);
        let frame = Frame::request(
            HANDSHAKE_ID,
            CONNECT_METHOD,
            serde_json::to_value(&self.params).ok(),
        );
        let sent = frame
            .to_text()
            .map_err(ClientError::from)
            .and_then(|text| match &self.session {
                Some(session) => session.send(text),
                None => Err(ClientError::NotConnected),
            });
        if let Err(e) = sent {
            log::warn!("failed to send connect: {}", e);
            self.close_session();
        }
    }

    fn on_message(&mut self, text: &str) {
        match parse_frame(text) {
            Ok(Frame::Response(res)) => self.on_response(res),
            Ok(Frame::Event(event)) => self.dispatch_event(event),
            Ok(Frame::Request(req)) => {
                log::debug!("ignoring gateway request {} ({})", req.id, req.method)
            }
            Err(e) => log::warn!("dropping malformed gateway frame: {}", e),
        }
    }

    fn on_response(&mut self, res: ResponseFrame) {
        if res.id == HANDSHAKE_ID {
            self.on_handshake_response(res);
            return;
        }
        let Some(reply) = self.pending.remove(&res.id) else {
            log::debug!("discarding response for unknown id {}", res.id);
            return;
        };
        let result = if res.ok {
            Ok(res.payload.unwrap_or(Value::Null))
        } else {
            Err(ClientError::Rpc(res.error.unwrap_or_else(ErrorInfo::unspecified)))
        };
        let _ = reply.send(result);
    }

    fn on_handshake_response(&mut self, res: ResponseFrame) {
        if self.state != ConnectionState::AwaitingHandshake {
            log::debug!("ignoring connect response in state {:?}", self.state);
            return;
        }
        if !res.ok {
            let err = res.error.unwrap_or_else(ErrorInfo::unspecified);
            log::warn!("gateway rejected connect: {}", err);
            self.close_session();
            return;
        }
        let hello = res
            .payload
            .and_then(|p| serde_json::from_value::<HelloOk>(p).ok());
        if let Some(hello) = &hello {
            log::info!("connected to gateway {} (protocol {})", self.url, hello.protocol);
        }
        self.status.set_hello(hello);
        if self.set_state(ConnectionState::Ready) {
            if let Some(on_open) = self.callbacks.on_open.as_mut() {
                on_open();
            }
        }
    }

    fn dispatch_event(&mut self, event: EventFrame) {
        if let Some(on_event) = self.callbacks.on_event.as_mut() {
            on_event(&event);
        }
        // No subscribers is fine; the frame is simply not delivered.
        let _ = self.status.events.send(event);
    }

    fn on_transport_closed(&mut self, code: u16, reason: String) {
        self.session = None;
        self.status.set_hello(None);
        log::debug!("gateway socket closed ({}): {}", code, reason);
        if !self.status.is_active() {
            self.fail_pending(|| ClientError::Stopped);
            self.set_state(ConnectionState::Closed);
            return;
        }
        self.fail_pending(|| ClientError::ConnectionLost {
            code,
            reason: reason.clone(),
        });
        self.set_state(ConnectionState::Connecting);
        if let Some(on_close) = self.callbacks.on_close.as_mut() {
            on_close(code, &reason);
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.retry_at.is_some() {
            return;
        }
        let delay = self.backoff.next_delay();
        log::info!("reconnecting to gateway in {:?}", delay);
        self.retry_at = Some(Instant::now() + delay);
    }

    fn open_session(&mut self) {
        self.retry_at = None;
        self.session_seq += 1;
        let signals = SessionSignals::new(self.session_seq, self.signals_tx.clone());
        self.session = Some(self.connector.open(&self.url, signals));
        self.set_state(ConnectionState::Connecting);
    }

    /// Asks the transport to close; the reconnect path runs when it reports `Closed`.
    fn close_session(&self) {
        if let Some(session) = &self.session {
            session.close();
        }
    }

    fn shutdown(&mut self) {
        self.retry_at = None;
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.status.set_hello(None);
        self.fail_pending(|| ClientError::Stopped);
        self.set_state(ConnectionState::Closed);
    }

    fn fail_pending(&mut self, err: impl Fn() -> ClientError) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(err()));
        }
    }

    fn set_state(&mut self, state: ConnectionState) -> bool {
        if self.state != state {
            log::debug!("gateway client: {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.status.publish(state)
    }
}
