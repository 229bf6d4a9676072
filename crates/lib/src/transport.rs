//! Transport session: one WebSocket at a time, surfaced as open/message/closed/error signals.
//!
//! A [`Connector`] opens a session and hands back a [`SessionHandle`] for outbound traffic.
//! Inbound traffic flows through [`SessionSignals`], tagged with the session id so the
//! client can drop anything still arriving from a session it already replaced.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::ClientError;

/// Close code used when the client closes the socket itself.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code reported when the peer closed without a status.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Close code reported for resets, failed connects and other transport errors.
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// Socket is connected; no application handshake has happened yet.
    Open,
    Message(String),
    /// Emitted exactly once per session, whatever ended it.
    Closed { code: u16, reason: String },
    /// Informational; a `Closed` always follows.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: u64,
    pub signal: TransportSignal,
}

/// Producer side of a session's signals.
///
/// [`SessionSignals::closed`] consumes the value, so a session cannot report closure twice.
#[derive(Debug)]
pub struct SessionSignals {
    session: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionSignals {
    pub fn new(session: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn open(&self) {
        self.emit(TransportSignal::Open);
    }

    pub fn message(&self, text: impl Into<String>) {
        self.emit(TransportSignal::Message(text.into()));
    }

    pub fn error(&self, detail: impl Into<String>) {
        self.emit(TransportSignal::Error(detail.into()));
    }

    pub fn closed(self, code: u16, reason: impl Into<String>) {
        self.emit(TransportSignal::Closed {
            code,
            reason: reason.into(),
        });
    }

    fn emit(&self, signal: TransportSignal) {
        // Receiver gone means the client itself is gone.
        let _ = self.tx.send(SessionEvent {
            session: self.session,
            signal,
        });
    }
}

/// Outbound command for a session's socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Client-side handle to one session.
#[derive(Debug)]
pub struct SessionHandle {
    session: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SessionHandle {
    /// Creates a handle plus the receiver the socket task drains.
    pub fn channel(session: u64) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { session, tx }, rx)
    }

    pub fn id(&self) -> u64 {
        self.session
    }

    /// Queues one serialized frame. Fails once the socket task has exited.
    pub fn send(&self, text: String) -> Result<(), ClientError> {
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| ClientError::Transport("socket is not open".to_string()))
    }

    /// Requests shutdown. The session still reports `Closed` when it is done.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Opens transport sessions for the client.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, url: &str, signals: SessionSignals) -> SessionHandle;
}

/// WebSocket connector backed by tokio-tungstenite. Must be used inside a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, url: &str, signals: SessionSignals) -> SessionHandle {
        let (handle, outbound) = SessionHandle::channel(signals.session());
        tokio::spawn(run_ws_session(url.to_string(), signals, outbound));
        handle
    }
}

async fn run_ws_session(
    url: String,
    signals: SessionSignals,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut ws = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            log::debug!("ws connect to {} failed: {}", url, e);
            signals.error(e.to_string());
            signals.closed(CLOSE_ABNORMAL, e.to_string());
            return;
        }
    };
    signals.open();

    let (code, reason) = loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = ws.send(Message::Text(text)).await {
                        signals.error(e.to_string());
                        break (CLOSE_ABNORMAL, e.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = ws.close(None).await;
                    break (CLOSE_NORMAL, "closed by client".to_string());
                }
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => signals.message(text),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    signals.error(e.to_string());
                    break (CLOSE_ABNORMAL, e.to_string());
                }
                None => break (CLOSE_ABNORMAL, "connection ended".to_string()),
            },
        }
    };
    signals.closed(code, reason);
}
