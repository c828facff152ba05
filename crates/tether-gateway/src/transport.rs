use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::frame::{Frame, FrameKind, WireSink, WireStream};
use crate::inflate::{Inflate, Inflater};
use crate::ws;

/// Close code used when the peer vanished without a close frame.
const ABNORMAL_CLOSE: u16 = 1006;

/// Observable connection lifecycle. There is no stored handshake state:
/// `connect` only yields a transport once the socket is open, so the
/// connecting phase is the pending `connect` call itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Disconnected = 0,
    Connected = 1,
    Disconnecting = 2,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connected,
            2 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

/// Signals emitted by a connection's receive loop.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// Exactly one per complete logical message. With compression enabled,
    /// binary payloads surface here already inflated, as text.
    Message { kind: FrameKind, payload: Bytes },
    Closed {
        code: u16,
        reason: String,
        initiated_by_remote: bool,
    },
    /// A fault inside the receive loop; implies disconnect. The transport
    /// never reconnects itself; retry/backoff is the caller's call.
    Error { error: GatewayError },
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub url: String,
    /// Outgoing payloads larger than this are split into ordered fragments,
    /// the last marked final.
    pub frame_size: usize,
    /// Capacity of the emitted event channel.
    pub event_buffer: usize,
    /// Run a continuous-stream inflater over incoming binary payloads.
    pub compression: bool,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            frame_size: 4096,
            event_buffer: 256,
            compression: true,
        }
    }
}

/// Persistent message-framed connection.
///
/// The send path and the receive loop run concurrently; only sends are
/// mutually excluded. The receive loop is the sole reader and the sole
/// caller feeding the inflater.
pub struct Transport {
    sink: Arc<Mutex<Box<dyn WireSink>>>,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    recv_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    frame_size: usize,
}

impl Transport {
    /// Connect to the configured endpoint and start the receive loop.
    /// Fails with a handshake error if the endpoint refuses us.
    pub async fn connect(
        config: TransportConfig,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), GatewayError> {
        let (sink, stream) = ws::connect(&config.url).await?;
        debug!(url = %config.url, "transport connected");
        Ok(Self::start(Box::new(sink), Box::new(stream), &config))
    }

    /// Attach to an already-open wire. Used by `connect` and by tests that
    /// script the wire directly.
    pub fn start(
        sink: Box<dyn WireSink>,
        stream: Box<dyn WireStream>,
        config: &TransportConfig,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
        let state = Arc::new(AtomicU8::new(TransportState::Connected as u8));
        let cancel = CancellationToken::new();
        let inflater = config.compression.then(Inflater::stream);

        let recv_task = tokio::spawn(receive_loop(
            stream,
            events_tx.clone(),
            Arc::clone(&state),
            cancel.clone(),
            inflater,
        ));

        let transport = Self {
            sink: Arc::new(Mutex::new(sink)),
            events: events_tx,
            state,
            cancel,
            recv_task: parking_lot::Mutex::new(Some(recv_task)),
            frame_size: config.frame_size,
        };
        (transport, events_rx)
    }

    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Send one logical text message, split into ordered fragments over the
    /// frame-size limit. Sends are serialized by one mutex so no two
    /// logical messages interleave on the wire. A concurrent disconnect
    /// cancels the send between (or during) fragments.
    pub async fn send(&self, text: &str) -> Result<(), GatewayError> {
        if self.state() != TransportState::Connected {
            return Err(GatewayError::NotConnected);
        }
        let mut sink = self.sink.lock().await;
        let bytes = text.as_bytes();
        if bytes.is_empty() {
            return self.send_frame(&mut sink, Frame::text("")).await;
        }
        let mut offset = 0;
        while offset < bytes.len() {
            let end = usize::min(offset + self.frame_size, bytes.len());
            let fin = end == bytes.len();
            self.send_frame(
                &mut sink,
                Frame::fragment(
                    FrameKind::Text,
                    Bytes::copy_from_slice(&bytes[offset..end]),
                    fin,
                ),
            )
            .await?;
            offset = end;
        }
        Ok(())
    }

    /// One wire send racing the connection's cancellation token, so a sink
    /// stalled on backpressure cannot outlive a disconnect.
    async fn send_frame(
        &self,
        sink: &mut Box<dyn WireSink>,
        frame: Frame,
    ) -> Result<(), GatewayError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(GatewayError::NotConnected),
            result = sink.send(frame) => result,
        }
    }

    /// Close the connection from our side: stop the receive loop, send a
    /// close frame, and emit a locally-initiated `Closed` event.
    pub async fn disconnect(&self, code: u16, reason: &str) -> Result<(), GatewayError> {
        let current = self.state();
        if current == TransportState::Disconnected || current == TransportState::Disconnecting {
            return Ok(());
        }
        self.state
            .store(TransportState::Disconnecting as u8, Ordering::Release);
        self.cancel.cancel();

        let task = self.recv_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        // Best effort: the peer may already be gone.
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close(code, reason).await {
            debug!(error = %e, "close frame not delivered");
        }
        drop(sink);

        self.state
            .store(TransportState::Disconnected as u8, Ordering::Release);
        let _ = self
            .events
            .send(TransportEvent::Closed {
                code,
                reason: reason.to_string(),
                initiated_by_remote: false,
            })
            .await;
        Ok(())
    }
}

/// The one long-lived receive loop per connection. Accumulates fragments of
/// one logical message until the final fragment, then emits exactly one
/// message event; ends on remote close, fault, or cancellation.
async fn receive_loop(
    mut stream: Box<dyn WireStream>,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    mut inflater: Option<Inflater>,
) {
    let mut pending: Option<(FrameKind, BytesMut)> = None;

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = stream.recv() => received,
        };

        match received {
            Err(error) => {
                warn!(kind = error.error_kind(), error = %error, "receive loop fault");
                let _ = events.send(TransportEvent::Error { error }).await;
                break;
            }
            Ok(None) => {
                let _ = events
                    .send(TransportEvent::Closed {
                        code: ABNORMAL_CLOSE,
                        reason: "connection reset".into(),
                        initiated_by_remote: true,
                    })
                    .await;
                break;
            }
            Ok(Some(Frame::Close { code, reason })) => {
                debug!(code, reason = %reason, "remote close");
                let _ = events
                    .send(TransportEvent::Closed {
                        code,
                        reason,
                        initiated_by_remote: true,
                    })
                    .await;
                break;
            }
            Ok(Some(Frame::Data { kind, bytes, fin })) => {
                let (kind, mut buffer) = match pending.take() {
                    Some((kind, buffer)) => (kind, buffer),
                    None => (kind, BytesMut::with_capacity(bytes.len())),
                };
                buffer.extend_from_slice(&bytes);
                if !fin {
                    pending = Some((kind, buffer));
                    continue;
                }
                emit_message(&events, kind, buffer.freeze(), inflater.as_mut()).await;
            }
        }
    }

    state.store(TransportState::Disconnected as u8, Ordering::Release);
}

async fn emit_message(
    events: &mpsc::Sender<TransportEvent>,
    kind: FrameKind,
    payload: Bytes,
    inflater: Option<&mut Inflater>,
) {
    match (kind, inflater) {
        (FrameKind::Binary, Some(inflater)) => match inflater.push(&payload) {
            Inflate::Complete(text) => {
                let _ = events
                    .send(TransportEvent::Message {
                        kind: FrameKind::Text,
                        payload: Bytes::from(text),
                    })
                    .await;
            }
            Inflate::Pending => {}
            Inflate::Failed => {
                warn!(len = payload.len(), "dropping undecodable compressed payload");
            }
        },
        (kind, _) => {
            let _ = events
                .send(TransportEvent::Message { kind, payload })
                .await;
        }
    }
}
