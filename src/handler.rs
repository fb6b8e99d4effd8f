use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::frame::{self, DecodedFrame};
use crate::outbound::DeliveryOutcome;
use crate::registry::LocalChannelRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The frame was refused; the connection keeps going.
    #[error("frame rejected: {0}")]
    Rejected(String),
    /// The connection cannot continue.
    #[error("fatal handler failure: {0}")]
    Fatal(String),
}

/// Deployment-specific processing of decoded frames.
///
/// Called at most once per inbound message, in receive order, and only on
/// authorized connections.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(&self, frame: DecodedFrame) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Log,
    Echo,
    /// Dispatch by channel id through the configured route table.
    Route,
}

/// Where a routed channel's frames end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    Log,
    Echo,
}

pub fn build_handler(
    kind: HandlerKind,
    routes: &BTreeMap<u8, RouteTarget>,
    registry: LocalChannelRegistry,
) -> Arc<dyn FrameHandler> {
    match kind {
        HandlerKind::Log => Arc::new(LoggingFrameHandler),
        HandlerKind::Echo => Arc::new(EchoFrameHandler::new(registry)),
        HandlerKind::Route => {
            let log: Arc<dyn FrameHandler> = Arc::new(LoggingFrameHandler);
            let echo: Arc<dyn FrameHandler> = Arc::new(EchoFrameHandler::new(registry));
            let table = routes
                .iter()
                .map(|(channel_id, target)| {
                    let handler = match target {
                        RouteTarget::Log => log.clone(),
                        RouteTarget::Echo => echo.clone(),
                    };
                    (*channel_id, handler)
                })
                .collect();
            Arc::new(RoutingFrameHandler::new(table))
        }
    }
}

/// Hands each frame to the handler registered for its channel id.
/// Frames on channels without a route are rejected.
pub struct RoutingFrameHandler {
    routes: HashMap<u8, Arc<dyn FrameHandler>>,
}

impl RoutingFrameHandler {
    pub fn new(routes: HashMap<u8, Arc<dyn FrameHandler>>) -> Self {
        Self { routes }
    }
}

#[async_trait]
impl FrameHandler for RoutingFrameHandler {
    async fn handle(&self, frame: DecodedFrame) -> Result<(), HandlerError> {
        match self.routes.get(&frame.channel_id) {
            Some(handler) => handler.handle(frame).await,
            None => Err(HandlerError::Rejected(format!(
                "no route for channel {}",
                frame.channel_id
            ))),
        }
    }
}

pub struct LoggingFrameHandler;

#[async_trait]
impl FrameHandler for LoggingFrameHandler {
    async fn handle(&self, frame: DecodedFrame) -> Result<(), HandlerError> {
        info!(
            connection_id = %frame.connection_id,
            subject = %frame.subject,
            channel = frame.channel_id,
            protocol = frame.protocol_tag,
            body_len = frame.body.len(),
            "frame received"
        );
        Ok(())
    }
}

/// Sends every frame back to the connection it arrived on.
pub struct EchoFrameHandler {
    registry: LocalChannelRegistry,
}

impl EchoFrameHandler {
    pub fn new(registry: LocalChannelRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl FrameHandler for EchoFrameHandler {
    async fn handle(&self, frame: DecodedFrame) -> Result<(), HandlerError> {
        let payload = frame::encode(frame.channel_id, frame.protocol_tag, &frame.body);
        match self.registry.deliver(&frame.connection_id, payload).await {
            Some(DeliveryOutcome::Delivered) => Ok(()),
            Some(DeliveryOutcome::Dropped) => {
                debug!(connection_id = %frame.connection_id, "echo dropped on full queue");
                Ok(())
            }
            Some(DeliveryOutcome::Closed) | None => Err(HandlerError::Rejected(format!(
                "connection {} is no longer registered",
                frame.connection_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{
        build_handler, FrameHandler, HandlerError, HandlerKind, LoggingFrameHandler, RouteTarget,
        RoutingFrameHandler,
    };
    use crate::frame::{self, DecodedFrame};
    use crate::outbound::{channel, OutboundEvent, OverflowPolicy};
    use crate::registry::{ChannelRegistry, LocalChannelRegistry};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FrameHandler for CountingHandler {
        async fn handle(&self, _frame: DecodedFrame) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn frame_on(channel_id: u8, connection_id: &str) -> DecodedFrame {
        DecodedFrame {
            channel_id,
            ..sample_frame(connection_id)
        }
    }

    fn sample_frame(connection_id: &str) -> DecodedFrame {
        DecodedFrame {
            channel_id: 3,
            protocol_tag: 0x0102,
            subject: "alice".to_owned(),
            connection_id: connection_id.to_owned(),
            body: b"ping".to_vec(),
        }
    }

    #[tokio::test]
    async fn logging_handler_accepts_everything() {
        assert_eq!(LoggingFrameHandler.handle(sample_frame("c1")).await, Ok(()));
    }

    #[tokio::test]
    async fn echo_handler_reencodes_to_sender() {
        let registry = LocalChannelRegistry::new();
        let (endpoint, mut receiver) = channel(8, OverflowPolicy::Block);
        registry.register("c1", endpoint);
        let handler = build_handler(HandlerKind::Echo, &BTreeMap::new(), registry);

        handler.handle(sample_frame("c1")).await.expect("echo");
        assert_eq!(
            receiver.next().await,
            OutboundEvent::Payload(frame::encode(3, 0x0102, b"ping"))
        );
    }

    #[tokio::test]
    async fn echo_to_unknown_connection_is_rejected_not_fatal() {
        let handler = build_handler(HandlerKind::Echo, &BTreeMap::new(), LocalChannelRegistry::new());
        let err = handler
            .handle(sample_frame("gone"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, HandlerError::Rejected(_)));
    }

    #[tokio::test]
    async fn routing_dispatches_by_channel_id() {
        let chat = Arc::new(CountingHandler::default());
        let presence = Arc::new(CountingHandler::default());
        let mut routes: HashMap<u8, Arc<dyn FrameHandler>> = HashMap::new();
        routes.insert(1, chat.clone());
        routes.insert(2, presence.clone());
        let router = RoutingFrameHandler::new(routes);

        router.handle(frame_on(1, "c1")).await.expect("chat");
        router.handle(frame_on(1, "c1")).await.expect("chat");
        router.handle(frame_on(2, "c1")).await.expect("presence");
        let err = router.handle(frame_on(9, "c1")).await.expect_err("unrouted");

        assert_eq!(chat.calls.load(Ordering::SeqCst), 2);
        assert_eq!(presence.calls.load(Ordering::SeqCst), 1);
        assert_eq!(err, HandlerError::Rejected("no route for channel 9".to_owned()));
    }

    #[tokio::test]
    async fn configured_routes_echo_only_their_channels() {
        let registry = LocalChannelRegistry::new();
        let (endpoint, mut receiver) = channel(8, OverflowPolicy::Block);
        registry.register("c1", endpoint);
        let routes = BTreeMap::from([(1, RouteTarget::Echo), (2, RouteTarget::Log)]);
        let handler = build_handler(HandlerKind::Route, &routes, registry);

        handler.handle(frame_on(2, "c1")).await.expect("logged");
        handler.handle(frame_on(1, "c1")).await.expect("echoed");
        assert!(matches!(
            handler.handle(frame_on(3, "c1")).await,
            Err(HandlerError::Rejected(_))
        ));

        assert_eq!(
            receiver.next().await,
            OutboundEvent::Payload(frame::encode(1, 0x0102, b"ping"))
        );
        let nothing_else = tokio::time::timeout(Duration::from_millis(50), receiver.next()).await;
        assert!(nothing_else.is_err());
    }
}
