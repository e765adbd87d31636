use std::fmt;

/// Failure taxonomy for the gateway.
///
/// Only `Connection` (and escalated `Protocol`) failures reach the
/// reconnection controller; every other variant stays local to the wallet or
/// session that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Upstream node cannot be reached or the link dropped
    Connection(String),
    /// Upstream rejected a subscribe/unsubscribe request
    Subscribe(String),
    /// Malformed or unexpected upstream frame
    Protocol(String),
    /// Malformed client command, unknown chain or bad address
    ClientProtocol(String),
    /// A session's outbound queue overflowed
    Capacity(String),
    /// The chain worker is gone (shutdown in progress)
    Unavailable(String),
}

impl GatewayError {
    /// Whether this failure means the upstream link must be rebuilt
    pub fn is_link_fatal(&self) -> bool {
        matches!(self, GatewayError::Connection(_) | GatewayError::Protocol(_))
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Connection(msg) => write!(f, "connection error: {}", msg),
            GatewayError::Subscribe(msg) => write!(f, "subscribe error: {}", msg),
            GatewayError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            GatewayError::ClientProtocol(msg) => write!(f, "{}", msg),
            GatewayError::Capacity(msg) => write!(f, "capacity error: {}", msg),
            GatewayError::Unavailable(msg) => write!(f, "unavailable: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Connection(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Protocol(format!("invalid JSON: {}", e))
    }
}
