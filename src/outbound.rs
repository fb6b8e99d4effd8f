//! Per-connection outbound delivery queue.
//!
//! Any task may hold an [`OutboundEndpoint`] and push payloads; exactly one
//! [`OutboundReceiver`], owned by the connection's send loop, drains them. The
//! queue is bounded and [`OverflowPolicy`] decides what a producer experiences
//! when it is full.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

pub const MIN_OUTBOUND_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Producers wait until the send loop frees a slot.
    Block,
    /// The payload being delivered is discarded.
    DropNewest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Dropped,
    Closed,
}

#[derive(Debug, Clone)]
pub struct OutboundEndpoint {
    tx: mpsc::Sender<Vec<u8>>,
    close_tx: Arc<watch::Sender<bool>>,
    policy: OverflowPolicy,
}

#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
    close_rx: watch::Receiver<bool>,
}

pub fn channel(capacity: usize, policy: OverflowPolicy) -> (OutboundEndpoint, OutboundReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(MIN_OUTBOUND_CAPACITY));
    let (close_tx, close_rx) = watch::channel(false);
    (
        OutboundEndpoint {
            tx,
            close_tx: Arc::new(close_tx),
            policy,
        },
        OutboundReceiver { rx, close_rx },
    )
}

impl OutboundEndpoint {
    pub async fn deliver(&self, payload: Vec<u8>) -> DeliveryOutcome {
        if self.is_closed() {
            return DeliveryOutcome::Closed;
        }
        match self.policy {
            OverflowPolicy::Block => match self.tx.send(payload).await {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(_) => DeliveryOutcome::Closed,
            },
            OverflowPolicy::DropNewest => self.try_deliver(payload),
        }
    }

    /// Non-waiting delivery; a full queue always drops regardless of policy.
    pub fn try_deliver(&self, payload: Vec<u8>) -> DeliveryOutcome {
        if self.is_closed() {
            return DeliveryOutcome::Closed;
        }
        match self.tx.try_send(payload) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => DeliveryOutcome::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => DeliveryOutcome::Closed,
        }
    }

    /// Asks the owning connection to shut down. Repeated calls are no-ops.
    pub fn close(&self) {
        self.close_tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow() || self.tx.is_closed()
    }
}

/// What the send loop observes next on its queue.
#[derive(Debug, PartialEq, Eq)]
pub enum OutboundEvent {
    Payload(Vec<u8>),
    CloseRequested,
    /// Every endpoint clone is gone; nothing can be delivered any more.
    Drained,
}

impl OutboundReceiver {
    /// A pending close request wins over queued payloads.
    pub async fn next(&mut self) -> OutboundEvent {
        let close_rx = &mut self.close_rx;
        let rx = &mut self.rx;
        tokio::select! {
            biased;
            _ = wait_for_close(close_rx) => OutboundEvent::CloseRequested,
            item = rx.recv() => match item {
                Some(payload) => OutboundEvent::Payload(payload),
                None => OutboundEvent::Drained,
            },
        }
    }

    /// Stops accepting payloads; later deliveries report `Closed`.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

async fn wait_for_close(close_rx: &mut watch::Receiver<bool>) {
    if close_rx.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}
