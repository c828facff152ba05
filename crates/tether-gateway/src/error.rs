/// Typed error hierarchy for gateway transport operations.
///
/// A connection fault terminates the current connection only; sibling
/// connections are unaffected.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("socket error: {0}")]
    Socket(String),
    #[error("connection closed: {code} {reason}")]
    Closed { code: u16, reason: String },
    #[error("send failed: {0}")]
    SendFailed(String),
}

impl GatewayError {
    /// Whether this error terminates the connection it occurred on.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_) | Self::Socket(_) | Self::Closed { .. }
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::NotConnected => "not_connected",
            Self::AlreadyConnected => "already_connected",
            Self::Socket(_) => "socket",
            Self::Closed { .. } => "closed",
            Self::SendFailed(_) => "send_failed",
        }
    }
}
