use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::GatewayError;
use crate::frame::{Frame, FrameKind, WireSink, WireStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the peer vanished without a close frame.
const NO_STATUS: u16 = 1005;

/// Outgoing websocket half. Fragments of one logical message are buffered
/// until the final one, then sent as a single websocket message; the
/// websocket layer owns wire-level framing from there.
pub struct WsSink {
    sink: SplitSink<Socket, Message>,
    partial: Option<(FrameKind, Vec<u8>)>,
}

/// Incoming websocket half. The websocket layer reassembles fragments, so
/// every received message surfaces as one final frame; ping/pong stay
/// below this interface.
pub struct WsStream {
    stream: SplitStream<Socket>,
}

/// Open a websocket connection and split it into send/receive halves.
pub async fn connect(url: &str) -> Result<(WsSink, WsStream), GatewayError> {
    let (socket, response) = connect_async(url)
        .await
        .map_err(|e| GatewayError::Handshake(e.to_string()))?;
    debug!(status = response.status().as_u16(), "websocket handshake complete");
    let (sink, stream) = socket.split();
    Ok((
        WsSink {
            sink,
            partial: None,
        },
        WsStream { stream },
    ))
}

#[async_trait]
impl WireSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), GatewayError> {
        match frame {
            Frame::Data { kind, bytes, fin } => {
                let (kind, mut buffer) = match self.partial.take() {
                    Some((kind, buffer)) => (kind, buffer),
                    None => (kind, Vec::with_capacity(bytes.len())),
                };
                buffer.extend_from_slice(&bytes);
                if !fin {
                    self.partial = Some((kind, buffer));
                    return Ok(());
                }
                let message = match kind {
                    FrameKind::Text => Message::text(
                        String::from_utf8(buffer)
                            .map_err(|e| GatewayError::SendFailed(e.to_string()))?,
                    ),
                    FrameKind::Binary => Message::binary(buffer),
                };
                self.sink
                    .send(message)
                    .await
                    .map_err(|e| GatewayError::Socket(e.to_string()))
            }
            Frame::Close { code, reason } => self.close(code, &reason).await,
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), GatewayError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| GatewayError::Socket(e.to_string()))
    }
}

#[async_trait]
impl WireStream for WsStream {
    async fn recv(&mut self) -> Result<Option<Frame>, GatewayError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(GatewayError::Socket(e.to_string())),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Frame::Data {
                        kind: FrameKind::Text,
                        bytes: Bytes::from(text.as_str().to_owned()),
                        fin: true,
                    }));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(Some(Frame::Data {
                        kind: FrameKind::Binary,
                        bytes,
                        fin: true,
                    }));
                }
                Some(Ok(Message::Close(close))) => {
                    let (code, reason) = close
                        .map(|c| (u16::from(c.code), c.reason.as_str().to_owned()))
                        .unwrap_or((NO_STATUS, String::new()));
                    return Ok(Some(Frame::Close { code, reason }));
                }
                // Ping/pong are answered by the websocket layer.
                Some(Ok(_)) => continue,
            }
        }
    }
}
