use async_trait::async_trait;
use bytes::Bytes;

use crate::error::GatewayError;

/// Declared type of a data frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// One wire-level unit. A logical message may span multiple `Data` frames;
/// only the frame with `fin = true` completes it.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Data {
        kind: FrameKind,
        bytes: Bytes,
        fin: bool,
    },
    Close {
        code: u16,
        reason: String,
    },
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Data {
            kind: FrameKind::Text,
            bytes: Bytes::from(text.into()),
            fin: true,
        }
    }

    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Self::Data {
            kind: FrameKind::Binary,
            bytes: bytes.into(),
            fin: true,
        }
    }

    pub fn fragment(kind: FrameKind, bytes: impl Into<Bytes>, fin: bool) -> Self {
        Self::Data {
            kind,
            bytes: bytes.into(),
            fin,
        }
    }

    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close {
            code,
            reason: reason.into(),
        }
    }

    pub fn is_final(&self) -> bool {
        match self {
            Self::Data { fin, .. } => *fin,
            Self::Close { .. } => true,
        }
    }
}

/// Outgoing half of a connection. The transport serializes all sends
/// through one mutex, so implementations see whole logical messages in
/// order and never interleaved.
#[async_trait]
pub trait WireSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), GatewayError>;
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), GatewayError>;
}

/// Incoming half of a connection, read by the transport's single receive
/// loop. `Ok(None)` means the peer went away without a close frame.
#[async_trait]
pub trait WireStream: Send {
    async fn recv(&mut self) -> Result<Option<Frame>, GatewayError>;
}
