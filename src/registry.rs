use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::outbound::{DeliveryOutcome, OutboundEndpoint};

/// Maps connection ids to their outbound endpoints.
///
/// Both commands are fire-and-forget and synchronous so that connection
/// teardown can issue them from any context, including `Drop`.
pub trait ChannelRegistry: Send + Sync {
    fn register(&self, connection_id: &str, endpoint: OutboundEndpoint);
    fn deregister(&self, connection_id: &str);
}

/// In-process registry used by a standalone gateway.
#[derive(Debug, Clone, Default)]
pub struct LocalChannelRegistry {
    endpoints: Arc<Mutex<HashMap<String, OutboundEndpoint>>>,
}

impl LocalChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoint(&self, connection_id: &str) -> Option<OutboundEndpoint> {
        self.endpoints.lock().get(connection_id).cloned()
    }

    /// Pushes a payload to one connection, honouring its overflow policy.
    /// Returns `None` when the connection is not registered.
    pub async fn deliver(&self, connection_id: &str, payload: Vec<u8>) -> Option<DeliveryOutcome> {
        let endpoint = self.endpoint(connection_id)?;
        Some(endpoint.deliver(payload).await)
    }

    /// Requests a server-side close of one connection.
    #[cfg(test)]
    pub fn disconnect(&self, connection_id: &str) -> bool {
        match self.endpoint(connection_id) {
            Some(endpoint) => {
                endpoint.close();
                true
            }
            None => false,
        }
    }

    pub fn disconnect_all(&self) -> usize {
        let guard = self.endpoints.lock();
        for endpoint in guard.values() {
            endpoint.close();
        }
        guard.len()
    }

    #[cfg(test)]
    pub fn is_registered(&self, connection_id: &str) -> bool {
        self.endpoints.lock().contains_key(connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.endpoints.lock().len()
    }
}

impl ChannelRegistry for LocalChannelRegistry {
    fn register(&self, connection_id: &str, endpoint: OutboundEndpoint) {
        self.endpoints
            .lock()
            .insert(connection_id.to_owned(), endpoint);
    }

    fn deregister(&self, connection_id: &str) {
        self.endpoints.lock().remove(connection_id);
    }
}
