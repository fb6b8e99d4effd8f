//! Lifecycle of one authenticated gateway connection.
//!
//! A connection moves `Connecting -> Authenticating -> Open -> Closing ->
//! Closed`. Nothing is registered and no frame is dispatched until the
//! identity check and the session write have both succeeded. Once open, the
//! receive loop and the send loop are raced on the connection's task; the
//! first one to finish decides the [`TerminationCause`] and the other is
//! dropped. Teardown is owned by a guard so it also runs when the task is
//! cancelled.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::frame::{self, FrameError};
use crate::handler::{FrameHandler, HandlerError};
use crate::identity::IdentityValidator;
use crate::outbound::{self, OutboundEndpoint, OutboundEvent, OutboundReceiver, OverflowPolicy};
use crate::registry::ChannelRegistry;
use crate::session_store::{SessionRecord, SessionStore};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_advance_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Connecting, Closed)
                | (Authenticating, Open)
                | (Authenticating, Closed)
                | (Open, Closing)
                | (Closing, Closed)
        )
    }
}

/// What the transport captured while upgrading the connection.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub connection_id: String,
    pub remote_addr: Option<SocketAddr>,
    pub subject: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug)]
pub enum TerminationCause {
    ClientClosed,
    ServerClosed,
    Cancelled,
    ReceiveFailed(GatewayError),
    SendFailed(GatewayError),
}

impl TerminationCause {
    fn close_code(&self) -> u16 {
        match self {
            Self::ClientClosed | Self::ServerClosed | Self::Cancelled => 1000,
            Self::ReceiveFailed(err) | Self::SendFailed(err) => err.close_code(),
        }
    }
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => f.write_str("client closed"),
            Self::ServerClosed => f.write_str("server closed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::ReceiveFailed(err) => write!(f, "receive failed: {err}"),
            Self::SendFailed(err) => write!(f, "send failed: {err}"),
        }
    }
}

/// Collaborators injected into every connection.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub validator: Arc<dyn IdentityValidator>,
    pub store: Arc<dyn SessionStore>,
    pub registry: Arc<dyn ChannelRegistry>,
    pub handler: Arc<dyn FrameHandler>,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub outbound_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            overflow: OverflowPolicy::Block,
        }
    }
}

#[derive(Clone)]
pub struct ConnectionController {
    deps: ConnectionDeps,
    settings: ConnectionSettings,
}

struct Lifecycle<'a> {
    connection_id: &'a str,
    state: ConnectionState,
}

impl Lifecycle<'_> {
    fn advance(&mut self, next: ConnectionState) {
        if !self.state.can_advance_to(next) {
            warn!(
                connection_id = %self.connection_id,
                "ignoring invalid transition {:?} -> {:?}",
                self.state,
                next
            );
            return;
        }
        debug!(connection_id = %self.connection_id, "state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

impl ConnectionController {
    pub fn new(deps: ConnectionDeps, settings: ConnectionSettings) -> Self {
        Self { deps, settings }
    }

    /// Runs the connection to completion.
    ///
    /// Returns the error that kept the connection from opening, or the cause
    /// that ended an opened connection after teardown has run.
    pub async fn serve<S>(
        &self,
        mut ws: WebSocketStream<S>,
        handshake: Handshake,
    ) -> Result<TerminationCause, GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let connection_id = handshake.connection_id.as_str();
        let mut lifecycle = Lifecycle {
            connection_id,
            state: ConnectionState::Connecting,
        };

        let subject = match self.authorize(&handshake, &mut lifecycle).await {
            Ok(subject) => subject,
            Err(err) => {
                warn!(connection_id = %connection_id, "connection rejected: {err}");
                lifecycle.advance(ConnectionState::Closed);
                reject(&mut ws, &err).await;
                return Err(err);
            }
        };

        let (endpoint, mut outbound) =
            outbound::channel(self.settings.outbound_capacity, self.settings.overflow);
        self.deps.registry.register(connection_id, endpoint.clone());
        let teardown = Teardown::new(
            connection_id.to_owned(),
            subject.clone(),
            endpoint,
            self.deps.registry.clone(),
            self.deps.store.clone(),
        );
        lifecycle.advance(ConnectionState::Open);
        info!(
            connection_id = %connection_id,
            subject = %subject,
            remote = ?handshake.remote_addr,
            "connection open"
        );

        let (mut sink, mut stream) = ws.split();
        let cause = tokio::select! {
            cause = receive_loop(&mut stream, &subject, connection_id, self.deps.handler.as_ref()) => cause,
            cause = send_loop(&mut sink, &mut outbound) => cause,
        };

        lifecycle.advance(ConnectionState::Closing);
        info!(connection_id = %connection_id, subject = %subject, "terminating connection: {cause}");
        close_socket(&mut sink, cause.close_code()).await;
        outbound.close();
        teardown.complete(&cause);
        lifecycle.advance(ConnectionState::Closed);
        Ok(cause)
    }

    async fn authorize(
        &self,
        handshake: &Handshake,
        lifecycle: &mut Lifecycle<'_>,
    ) -> Result<String, GatewayError> {
        let subject = handshake
            .subject
            .as_deref()
            .map(str::trim)
            .filter(|subject| !subject.is_empty())
            .ok_or_else(|| {
                GatewayError::Configuration("missing required subject attribute".to_owned())
            })?;
        lifecycle.advance(ConnectionState::Authenticating);

        let token = handshake
            .token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| GatewayError::Auth("missing bearer token".to_owned()))?;
        if !self.deps.validator.validate(token, subject).await {
            return Err(GatewayError::Auth(format!(
                "token rejected for subject `{subject}`"
            )));
        }

        let record = SessionRecord::login(subject, &handshake.connection_id, token, now_ms());
        self.deps
            .store
            .set(subject, record)
            .await
            .map_err(|err| GatewayError::Auth(format!("session record write failed: {err}")))?;
        Ok(subject.to_owned())
    }
}

async fn receive_loop<S>(
    stream: &mut SplitStream<WebSocketStream<S>>,
    subject: &str,
    connection_id: &str,
    handler: &dyn FrameHandler,
) -> TerminationCause
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(inbound) = stream.next().await {
        let message = match inbound {
            Ok(message) => message,
            Err(err) => return TerminationCause::ReceiveFailed(GatewayError::transport(err)),
        };
        match message {
            Message::Binary(raw) => {
                let decoded = match frame::decode(&raw) {
                    Ok(frame) => frame.into_dispatch(subject, connection_id),
                    Err(err) => return TerminationCause::ReceiveFailed(err.into()),
                };
                match handler.handle(decoded).await {
                    Ok(()) => {}
                    Err(HandlerError::Rejected(reason)) => {
                        debug!(connection_id = %connection_id, "frame rejected by handler: {reason}");
                    }
                    Err(err @ HandlerError::Fatal(_)) => {
                        return TerminationCause::ReceiveFailed(GatewayError::transport(err));
                    }
                }
            }
            Message::Text(_) => {
                return TerminationCause::ReceiveFailed(FrameError::TextMessage.into());
            }
            Message::Close(_) => return TerminationCause::ClientClosed,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    TerminationCause::ClientClosed
}

async fn send_loop<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    outbound: &mut OutboundReceiver,
) -> TerminationCause
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match outbound.next().await {
            OutboundEvent::Payload(payload) => {
                if let Err(err) = sink.send(Message::Binary(payload)).await {
                    return TerminationCause::SendFailed(GatewayError::transport(err));
                }
            }
            OutboundEvent::CloseRequested | OutboundEvent::Drained => {
                return TerminationCause::ServerClosed;
            }
        }
    }
}

async fn close_socket<S>(sink: &mut SplitSink<WebSocketStream<S>, Message>, code: u16)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let closing = async {
        let _ = sink.send(Message::Close(Some(close_frame(code, "")))).await;
        let _ = sink.close().await;
    };
    if timeout(CLOSE_TIMEOUT, closing).await.is_err() {
        debug!("close handshake timed out");
    }
}

async fn reject<S>(ws: &mut WebSocketStream<S>, err: &GatewayError)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = if err.is_rejection() {
        "unauthorized"
    } else {
        "internal error"
    };
    let _ = timeout(
        CLOSE_TIMEOUT,
        ws.close(Some(close_frame(err.close_code(), reason))),
    )
    .await;
}

/// Exactly-once release of everything an open connection holds.
pub(crate) struct Teardown {
    connection_id: String,
    subject: String,
    endpoint: OutboundEndpoint,
    registry: Arc<dyn ChannelRegistry>,
    store: Arc<dyn SessionStore>,
    done: AtomicBool,
}

impl Teardown {
    pub(crate) fn new(
        connection_id: String,
        subject: String,
        endpoint: OutboundEndpoint,
        registry: Arc<dyn ChannelRegistry>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            connection_id,
            subject,
            endpoint,
            registry,
            store,
            done: AtomicBool::new(false),
        }
    }

    /// Returns `false` when an earlier call already tore the connection down.
    pub(crate) fn complete(&self, cause: &TerminationCause) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(
            connection_id = %self.connection_id,
            subject = %self.subject,
            "releasing connection ({cause})"
        );
        self.endpoint.close();
        self.registry.deregister(&self.connection_id);
        spawn_logout(
            self.store.clone(),
            self.subject.clone(),
            self.connection_id.clone(),
        );
        true
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.complete(&TerminationCause::Cancelled);
    }
}

fn spawn_logout(store: Arc<dyn SessionStore>, subject: String, connection_id: String) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!(connection_id = %connection_id, "no runtime available; skipping logout update");
        return;
    };
    handle.spawn(async move {
        if let Err(err) = record_logout(store.as_ref(), &subject).await {
            warn!(
                connection_id = %connection_id,
                subject = %subject,
                "session logout update failed: {err}"
            );
        }
    });
}

async fn record_logout(store: &dyn SessionStore, subject: &str) -> Result<(), GatewayError> {
    let Some(mut record) = store.get(subject).await? else {
        debug!(subject = %subject, "no session record to mark logged out");
        return Ok(());
    };
    record.last_logout_time = now_ms();
    store.set(subject, record).await?;
    Ok(())
}

fn close_frame(code: u16, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
