use flate2::{Decompress, FlushDecompress, Status};
use tracing::debug;

/// First byte of a 2-byte zlib header; when present the header is skipped
/// and the remainder is raw deflate data.
const ZLIB_MAGIC: u8 = 0x78;

/// Big-endian suffix marking a decompression boundary in stream mode
/// (the tail of a sync-flushed deflate block).
const STREAM_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Fresh decompressor state per payload.
    Payload,
    /// One decompressor persists for the connection's life; the remote
    /// treats the connection as a single unbroken compressed stream.
    Stream,
}

/// Outcome of feeding one chunk. Failure is a value, never an error: the
/// caller drops the payload and the connection stays up.
#[derive(Debug, PartialEq, Eq)]
pub enum Inflate {
    Complete(String),
    /// Stream mode only: the boundary marker has not arrived yet; keep
    /// submitting chunks.
    Pending,
    Failed,
}

/// Streaming zlib payload decompressor.
///
/// Not safe for concurrent submission: correctness relies on exactly one
/// caller (the transport's receive loop) feeding chunks in arrival order,
/// which is why the API is `&mut self` with no internal locking.
pub struct Inflater {
    mode: Mode,
    buffer: Vec<u8>,
    decompress: Decompress,
    header_handled: bool,
}

impl Inflater {
    /// Per-payload mode: decompressor state resets on every push.
    pub fn payload() -> Self {
        Self::new(Mode::Payload)
    }

    /// Continuous-stream mode: decompressor state spans all pushes.
    pub fn stream() -> Self {
        Self::new(Mode::Stream)
    }

    fn new(mode: Mode) -> Self {
        Self {
            mode,
            buffer: Vec::new(),
            decompress: Decompress::new(false),
            header_handled: false,
        }
    }

    /// Feed one chunk. In stream mode a chunk only becomes decompressible
    /// once it ends with the boundary marker; until then bytes accumulate
    /// and the call reports [`Inflate::Pending`]. The accumulation buffer
    /// is cleared after every decompression attempt, success or failure,
    /// to bound memory growth.
    pub fn push(&mut self, chunk: &[u8]) -> Inflate {
        self.buffer.extend_from_slice(chunk);
        if self.mode == Mode::Stream && !self.buffer.ends_with(&STREAM_SUFFIX) {
            return Inflate::Pending;
        }
        let result = self.inflate_buffered();
        self.buffer.clear();
        result
    }

    fn inflate_buffered(&mut self) -> Inflate {
        let mut input: &[u8] = &self.buffer;

        let strip_header = match self.mode {
            Mode::Payload => {
                self.decompress.reset(false);
                true
            }
            // The header can only sit at the very start of the stream.
            Mode::Stream => !self.header_handled,
        };
        if self.mode == Mode::Stream {
            self.header_handled = true;
        }
        if strip_header && input.first() == Some(&ZLIB_MAGIC) {
            if input.len() < 2 {
                return Inflate::Failed;
            }
            input = &input[2..];
        }

        let mut out: Vec<u8> = Vec::with_capacity(input.len().saturating_mul(4).max(256));
        loop {
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status =
                match self
                    .decompress
                    .decompress_vec(input, &mut out, FlushDecompress::Sync)
                {
                    Ok(status) => status,
                    Err(e) => {
                        debug!(error = %e, "inflate failed");
                        return Inflate::Failed;
                    }
                };
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = self.decompress.total_out() - before_out;
            input = &input[consumed..];

            if status == Status::StreamEnd {
                break;
            }
            // A full output buffer means the decompressor may still hold
            // pending bytes even after the last input byte was consumed;
            // grow and keep draining.
            if out.len() == out.capacity() {
                out.reserve(out.len().max(1024));
                continue;
            }
            if input.is_empty() {
                break;
            }
            if consumed == 0 && produced == 0 {
                // No forward progress with input left over: malformed data.
                debug!(leftover = input.len(), "inflate stalled");
                return Inflate::Failed;
            }
        }

        match String::from_utf8(out) {
            Ok(text) => Inflate::Complete(text),
            Err(e) => {
                debug!(error = %e, "inflated payload is not utf-8");
                Inflate::Failed
            }
        }
    }
}
