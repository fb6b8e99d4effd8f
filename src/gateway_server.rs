use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::connection::{now_ms, ConnectionController, Handshake};
use crate::registry::LocalChannelRegistry;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Accepts WebSocket upgrades and hands each one to the connection controller.
#[derive(Clone)]
pub struct GatewayServer {
    gateway: GatewayConfig,
    controller: ConnectionController,
    registry: LocalChannelRegistry,
    seq: Arc<AtomicU64>,
}

struct ConnectionContext {
    controller: ConnectionController,
    subject_header: String,
    handshake_timeout: Duration,
    max_frame_bytes: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct CapturedHeaders {
    subject: Option<String>,
    token: Option<String>,
}

impl CapturedHeaders {
    fn from_request(request: &Request, subject_header: &str) -> Self {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned)
        };
        Self {
            subject: header(subject_header),
            token: request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(bearer_token),
        }
    }
}

impl GatewayServer {
    pub fn new(
        gateway: GatewayConfig,
        controller: ConnectionController,
        registry: LocalChannelRegistry,
    ) -> Self {
        Self {
            gateway,
            controller,
            registry,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn run_forever(&self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.gateway.bind)
            .await
            .with_context(|| format!("failed binding gateway listener on {}", self.gateway.bind))?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!("channel gateway listening on ws://{bound_addr}");

        let context = Arc::new(ConnectionContext {
            controller: self.controller.clone(),
            subject_header: self.gateway.subject_header.clone(),
            handshake_timeout: Duration::from_millis(self.gateway.handshake_timeout_ms),
            max_frame_bytes: self.gateway.max_frame_bytes,
        });
        let permits = Arc::new(Semaphore::new(self.gateway.max_connections));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let Ok(permit) = permits.clone().try_acquire_owned() else {
                                warn!(
                                    "refusing {remote_addr}: connection limit of {} reached ({} open)",
                                    self.gateway.max_connections,
                                    self.registry.connection_count()
                                );
                                drop(stream);
                                continue;
                            };
                            let connection_id = self.next_connection_id();
                            let context = context.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, remote_addr, connection_id, context, permit).await {
                                    warn!("gateway connection failed: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("gateway accept failed: {err}");
                        }
                    }
                }
            }
        }

        drop(listener);
        let open = self.registry.disconnect_all();
        info!("gateway shutting down; closing {open} open connection(s)");
        let all = u32::try_from(self.gateway.max_connections).unwrap_or(u32::MAX);
        if timeout(SHUTDOWN_GRACE, permits.acquire_many(all)).await.is_err() {
            warn!("gateway shutdown grace period elapsed with connections still running");
        }
        Ok(())
    }

    fn next_connection_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("conn-{}-{seq}", now_ms())
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    connection_id: String,
    context: Arc<ConnectionContext>,
    _permit: OwnedSemaphorePermit,
) -> Result<()> {
    let mut captured = CapturedHeaders::default();
    let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        captured = CapturedHeaders::from_request(request, &context.subject_header);
        Ok(response)
    };
    let ws = timeout(
        context.handshake_timeout,
        accept_hdr_async_with_config(stream, capture, Some(ws_config(context.max_frame_bytes))),
    )
    .await
    .map_err(|_| anyhow!("websocket upgrade timed out for {remote_addr}"))?
    .with_context(|| format!("websocket upgrade failed for {remote_addr}"))?;

    let handshake = Handshake {
        connection_id,
        remote_addr: Some(remote_addr),
        subject: captured.subject,
        token: captured.token,
    };
    let connection_id = handshake.connection_id.clone();
    match context.controller.serve(ws, handshake).await {
        Ok(cause) => debug!(connection_id = %connection_id, "connection finished: {cause}"),
        Err(err) => debug!(connection_id = %connection_id, "connection refused: {err}"),
    }
    Ok(())
}

fn ws_config(max_frame_bytes: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_frame_bytes);
    config.max_frame_size = Some(max_frame_bytes);
    config
}

fn bearer_token(value: &str) -> Option<String> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_owned())
}
