//! Errors surfaced by the gateway client.

use crate::protocol::ErrorInfo;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// `request()` was called while the handshake has not completed.
    #[error("gateway not connected")]
    NotConnected,

    /// The connection dropped while the request was outstanding.
    #[error("gateway connection lost ({code}): {reason}")]
    ConnectionLost { code: u16, reason: String },

    /// `stop()` was called while the request was outstanding.
    #[error("client stopped")]
    Stopped,

    /// The gateway answered with `ok: false`.
    #[error("gateway error {0}")]
    Rpc(ErrorInfo),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The gateway did not become ready in time.
    #[error("timed out waiting for gateway connection")]
    Timeout,
}

impl ClientError {
    /// Whether issuing the same call again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::NotConnected
            | ClientError::ConnectionLost { .. }
            | ClientError::Transport(_)
            | ClientError::Timeout => true,
            ClientError::Rpc(info) => info.retryable.unwrap_or(false),
            ClientError::Stopped | ClientError::Json(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_lost_is_retryable() {
        let err = ClientError::ConnectionLost {
            code: 1006,
            reason: "reset".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "gateway connection lost (1006): reset");
    }

    #[test]
    fn rpc_retryable_follows_gateway_hint() {
        let mut info = ErrorInfo::new("UNAVAILABLE", "busy");
        assert!(!ClientError::Rpc(info.clone()).is_retryable());
        info.retryable = Some(true);
        assert!(ClientError::Rpc(info).is_retryable());
        assert!(!ClientError::Stopped.is_retryable());
    }
}
