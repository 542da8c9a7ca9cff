//! NDJSON framing for the sidecar wire protocol.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a configurable maximum line
//! length so a misbehaving client cannot make the peer buffer an unbounded
//! amount of data for a single frame.
//!
//! [`Framer`] is the push-style front end used by the peer read loop: raw
//! chunks go in through [`Framer::feed`], complete lines come out. Any
//! undelimited tail stays buffered until the next call, so a frame split
//! across two socket reads is reassembled byte-for-byte.

use std::collections::VecDeque;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Default maximum line length accepted by the codec: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Size of a single transport read.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Line codec for newline-delimited JSON frames.
///
/// Each `\n`-terminated UTF-8 string is one frame. A trailing `\r` is
/// stripped. Lines longer than the configured limit are discarded by the
/// inner [`LinesCodec`] and reported as [`AppError::Protocol`]; the codec
/// keeps decoding from the next newline onwards.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LinesCodec,
    max_line_bytes: usize,
}

impl FrameCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }

    fn map_error(&self, e: LinesCodecError) -> AppError {
        match e {
            LinesCodecError::MaxLineLengthExceeded => AppError::Protocol(format!(
                "line too long: exceeded {} bytes",
                self.max_line_bytes
            )),
            // LinesCodec performs no I/O itself; the only io::Error it
            // produces is the UTF-8 validation failure of an already
            // consumed line.
            LinesCodecError::Io(io_err) => AppError::Protocol(format!("invalid line: {io_err}")),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.inner.decode(src).map_err(|e| self.map_error(e))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.inner.decode_eof(src).map_err(|e| self.map_error(e))
    }
}

/// Incremental byte-to-line framer.
#[derive(Debug, Default)]
pub struct Framer {
    codec: FrameCodec,
    buffer: BytesMut,
}

impl Framer {
    /// Create a framer with the given per-line limit.
    #[must_use]
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            codec: FrameCodec::with_max_line_bytes(max_line_bytes),
            buffer: BytesMut::new(),
        }
    }

    /// Buffer `bytes` and return every complete, non-blank line now available.
    ///
    /// Oversized or non-UTF-8 lines are logged and skipped.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        lines.push(line);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "framer: dropping undecodable line");
                }
            }
        }
        lines
    }

    /// Number of buffered bytes that do not yet form a complete line.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Discard the undelimited remainder at end of stream.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() {
            debug!(
                bytes = self.buffer.len(),
                "framer: discarding unterminated trailing data at EOF"
            );
            self.buffer.clear();
        }
        // The inner codec tracks a scan offset into the buffer it saw.
        self.codec = FrameCodec::with_max_line_bytes(self.codec.max_line_bytes);
    }
}

/// Pull-style line reader over any [`AsyncRead`].
///
/// [`LineReader::next_line`] is cancel-safe: complete lines already framed
/// stay queued inside the reader, so it can sit in a `tokio::select!` arm.
#[derive(Debug)]
pub struct LineReader<R> {
    reader: R,
    framer: Framer,
    ready: VecDeque<String>,
    chunk: Box<[u8]>,
    eof: bool,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap `reader`, enforcing `max_line_bytes` per line.
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            framer: Framer::new(max_line_bytes),
            ready: VecDeque::new(),
            chunk: vec![0_u8; READ_CHUNK_BYTES].into_boxed_slice(),
            eof: false,
        }
    }

    /// Next complete line, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] when the underlying read fails.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(None);
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                self.framer.finish();
                self.eof = true;
            } else {
                let lines = self.framer.feed(&self.chunk[..n]);
                self.ready.extend(lines);
            }
        }
    }
}
