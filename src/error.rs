use thiserror::Error;

use crate::frame::FrameError;
use crate::session_store::StoreError;

/// Failure taxonomy for a single gateway connection.
///
/// `Configuration` and `Auth` stop a connection before it opens, so nothing
/// needs cleaning up besides the socket. `Framing` and `Transport` end an open
/// connection and go through the full teardown. `Store` only ever surfaces from
/// best-effort session writes and is logged, never propagated to the client.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("connection configuration error: {0}")]
    Configuration(String),
    #[error("authorization failed: {0}")]
    Auth(String),
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
    #[error("transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// WebSocket close code reported to the peer for this failure.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Configuration(_) | Self::Auth(_) => 1008,
            Self::Framing(_) => 1002,
            Self::Store(_) | Self::Transport(_) => 1011,
        }
    }

    /// Whether the connection never reached the open state because of this error.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::GatewayError;
    use crate::frame::FrameError;

    #[test]
    fn rejections_map_to_policy_violation_close() {
        let err = GatewayError::Configuration("missing subject header `user`".to_owned());
        assert!(err.is_rejection());
        assert_eq!(err.close_code(), 1008);
        assert_eq!(GatewayError::Auth("bad token".to_owned()).close_code(), 1008);
    }

    #[test]
    fn framing_errors_end_open_connections_with_protocol_error() {
        let err = GatewayError::from(FrameError::TooShort { len: 2 });
        assert!(!err.is_rejection());
        assert_eq!(err.close_code(), 1002);
        assert!(err.to_string().contains("2 bytes"));
    }

    #[test]
    fn server_faults_close_with_internal_error() {
        let err = GatewayError::transport("connection reset");
        assert!(!err.is_rejection());
        assert_eq!(err.close_code(), 1011);
        assert_eq!(err.to_string(), "transport error: connection reset");

        let store = GatewayError::from(crate::session_store::StoreError::Backend(
            "disk full".to_owned(),
        ));
        assert_eq!(store.close_code(), 1011);
    }
}
