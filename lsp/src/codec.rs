//! JSON-RPC framing codec.
//!
//! Messages are framed as `Content-Length: N\r\n\r\n<N bytes of UTF-8>` over a
//! pipe or socket. [`FrameDecoder`] is a sans-IO state machine that accepts
//! arbitrary chunks and yields complete bodies; [`FrameReader`] and
//! [`FrameWriter`] drive it over async streams.
//!
//! The codec owns no protocol semantics: bodies are handed out as strings and
//! JSON decoding happens one layer up.

use std::io;
use std::string::FromUtf8Error;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (64 MiB) to prevent unbounded memory allocation.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// A header line longer than this is discarded.
const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),
    #[error("Content-Length {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("frame body is not valid UTF-8")]
    InvalidUtf8(#[from] FromUtf8Error),
    #[error("unexpected EOF inside a frame")]
    UnexpectedEof,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Whether the stream can no longer be read after this error.
    ///
    /// Header and body errors only cost the offending line or message.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnexpectedEof | Self::Io(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Headers {
        content_length: Option<usize>,
        seen_header: bool,
    },
    Content {
        length: usize,
    },
}

impl DecodeState {
    const START: Self = Self::Headers {
        content_length: None,
        seen_header: false,
    };
}

/// Incremental frame decoder: `HEADERS -> CONTENT -> HEADERS -> ...`.
///
/// Partial input is buffered until enough bytes arrive; nothing is dropped
/// except lines reported as errors.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    state: DecodeState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: DecodeState::START,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Whether a frame has been started but not completed.
    #[must_use]
    pub fn is_mid_frame(&self) -> bool {
        match self.state {
            DecodeState::Headers { seen_header, .. } => {
                seen_header || self.buf.iter().any(|b| !b.is_ascii_whitespace())
            }
            DecodeState::Content { .. } => true,
        }
    }

    /// Pull the next complete body out of the buffer.
    ///
    /// Returns `None` when more input is needed. An `Err` reports a skipped
    /// header line or undecodable body; decoding can continue afterwards.
    pub fn next_frame(&mut self) -> Option<Result<String, FrameError>> {
        loop {
            match self.state {
                DecodeState::Headers {
                    content_length,
                    seen_header,
                } => {
                    let Some(newline) = self.buf.iter().position(|&b| b == b'\n') else {
                        if self.buf.len() > MAX_HEADER_LINE_BYTES {
                            let dropped = self.buf.len();
                            self.buf.clear();
                            return Some(Err(FrameError::MalformedHeader(format!(
                                "<{dropped} bytes without a line break>"
                            ))));
                        }
                        return None;
                    };
                    let raw: Vec<u8> = self.buf.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end_matches(['\r', '\n']);

                    if line.is_empty() {
                        match (content_length, seen_header) {
                            (Some(length), _) => {
                                self.state = DecodeState::Content { length };
                            }
                            // Stray blank line between frames.
                            (None, false) => {}
                            (None, true) => {
                                self.state = DecodeState::START;
                                return Some(Err(FrameError::MissingContentLength));
                            }
                        }
                        continue;
                    }

                    self.state = DecodeState::Headers {
                        content_length,
                        seen_header: true,
                    };
                    match parse_header(line) {
                        Ok(Some(length)) => {
                            self.state = DecodeState::Headers {
                                content_length: Some(length),
                                seen_header: true,
                            };
                        }
                        // Other headers (e.g. Content-Type) are ignored.
                        Ok(None) => {}
                        Err(e) => return Some(Err(e)),
                    }
                }
                DecodeState::Content { length } => {
                    if self.buf.len() < length {
                        return None;
                    }
                    let body: Vec<u8> = self.buf.drain(..length).collect();
                    self.state = DecodeState::START;
                    return Some(String::from_utf8(body).map_err(FrameError::from));
                }
            }
        }
    }
}

/// Parse one header line. Returns the `Content-Length` value if this line
/// carries it.
fn parse_header(line: &str) -> Result<Option<usize>, FrameError> {
    let Some((key, value)) = line.split_once(':') else {
        return Err(FrameError::MalformedHeader(line.to_string()));
    };
    // The header name is "Content-Length" but parse case-insensitively for robustness.
    if !key.trim().eq_ignore_ascii_case("Content-Length") {
        return Ok(None);
    }
    let value = value.trim();
    let length: usize = value
        .parse()
        .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;
    if length > MAX_FRAME_BYTES {
        return Err(FrameError::FrameTooLarge {
            length,
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(Some(length))
}

/// Frame `body` for the wire. `Content-Length` counts bytes, not characters.
#[must_use]
pub fn encode_frame(body: &str) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body.as_bytes());
    frame
}

/// Reads framed bodies from an async reader.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; READ_CHUNK_BYTES].into_boxed_slice(),
        }
    }

    /// Read the next frame body.
    ///
    /// Returns `Ok(None)` on a clean EOF between frames. Non-fatal errors
    /// (see [`FrameError::is_fatal`]) may be followed by further reads.
    pub async fn read_frame(&mut self) -> Result<Option<String>, FrameError> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return frame.map(Some);
            }

            let read = self.reader.read(&mut self.chunk).await?;
            if read == 0 {
                if self.decoder.is_mid_frame() {
                    return Err(FrameError::UnexpectedEof);
                }
                return Ok(None);
            }
            self.decoder.push(&self.chunk[..read]);
        }
    }
}

/// Writes framed bodies to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one frame and flush.
    pub async fn write_frame(&mut self, body: &str) -> io::Result<()> {
        self.writer.write_all(&encode_frame(body)).await?;
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
