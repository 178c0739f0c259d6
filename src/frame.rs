//! Length-prefixed frame codec.
//!
//! Requests and responses share one framing:
//!
//! ```text
//! frame  := header body
//! header := 4 ASCII decimal digits, the byte length of body ("0034")
//! body   := exactly <header> bytes of UTF-8, 1..=9216 bytes
//! ```
//!
//! Reads run against absolute deadlines and tolerate a bounded number of
//! transient errors per read phase. Writes are attempted exactly once.

use crate::connection::ConnPhase;
use crate::error::ConnError;
use bytes::{BufMut, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Length of the ASCII length header.
pub const HEADER_LEN: usize = 4;

/// Largest body a request frame may declare.
pub const MAX_BODY_LEN: usize = 9 * 1024;

/// Largest length a 4-digit header can carry.
const MAX_HEADER_VALUE: usize = 9999;

/// Transient read errors tolerated per read phase.
pub const MAX_READ_RETRIES: u32 = 5;

/// Diagnostic sent when the header declares a zero or negative length.
pub const BODY_LEN_ZERO: &[u8] = b"body len in head is zero";

/// Diagnostic sent when the header declares more than [`MAX_BODY_LEN`].
pub const BODY_LEN_TOO_LONG: &[u8] = b"body len in head, too long";

/// Per-phase budgets for one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTimeouts {
    /// Budget for reading the header, counted from the start of the read.
    pub header: Duration,
    /// Separate budget for the body. `None` keeps the header deadline.
    pub body: Option<Duration>,
    /// Budget for writing one response frame.
    pub write: Duration,
}

/// A declared body length the server refuses to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLenViolation {
    /// Zero or negative.
    Zero,
    /// Larger than [`MAX_BODY_LEN`].
    TooLong,
}

impl BodyLenViolation {
    /// The diagnostic body sent back to the client.
    pub fn diagnostic(self) -> &'static [u8] {
        match self {
            BodyLenViolation::Zero => BODY_LEN_ZERO,
            BodyLenViolation::TooLong => BODY_LEN_TOO_LONG,
        }
    }
}

/// Frame a body: zero-padded 4-digit length followed by the bytes.
pub fn encode_frame(body: &[u8]) -> Result<BytesMut, ConnError> {
    if body.is_empty() {
        return Err(ConnError::EmptyResponse);
    }
    if body.len() > MAX_HEADER_VALUE {
        return Err(ConnError::ResponseTooLong { len: body.len() });
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
    frame.put_slice(format!("{:04}", body.len()).as_bytes());
    frame.put_slice(body);
    Ok(frame)
}

/// Parse the length header as a signed decimal integer.
///
/// Range checking is left to [`check_body_len`] so that out-of-range values
/// can be answered with a diagnostic instead of a bare close.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<i32, ConnError> {
    std::str::from_utf8(header)
        .ok()
        .and_then(|s| s.parse::<i32>().ok())
        .ok_or_else(|| ConnError::Format {
            header: String::from_utf8_lossy(header).into_owned(),
        })
}

/// Check a declared body length against `(0, MAX_BODY_LEN]`.
pub fn check_body_len(len: i32) -> Result<usize, BodyLenViolation> {
    match usize::try_from(len) {
        Ok(0) | Err(_) => Err(BodyLenViolation::Zero),
        Ok(n) if n > MAX_BODY_LEN => Err(BodyLenViolation::TooLong),
        Ok(n) => Ok(n),
    }
}

/// The earlier of `now + budget` and the connection-wide `cap`.
pub fn deadline_within(budget: Duration, cap: Instant) -> Instant {
    (Instant::now() + budget).min(cap)
}

/// Read one request frame and return its body.
///
/// Every phase deadline is additionally bounded by `conn_deadline`.
pub async fn read_frame<S>(
    stream: &mut S,
    timeouts: &FrameTimeouts,
    conn_deadline: Instant,
) -> Result<Vec<u8>, ConnError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let header_deadline = deadline_within(timeouts.header, conn_deadline);
    let len = read_header(stream, header_deadline, timeouts, conn_deadline).await?;
    let deadline = body_deadline(timeouts, header_deadline, conn_deadline);
    read_body(stream, len, deadline).await
}

/// Read and validate the length header, returning the body length.
///
/// An out-of-range length is answered with a diagnostic frame before the
/// error is returned, so the client learns why it is being disconnected.
pub async fn read_header<S>(
    stream: &mut S,
    deadline: Instant,
    timeouts: &FrameTimeouts,
    conn_deadline: Instant,
) -> Result<usize, ConnError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    read_full(stream, &mut header, ConnPhase::ReadHeader, deadline).await?;
    let declared = parse_header(&header)?;
    debug!(len = declared, "Received header");

    match check_body_len(declared) {
        Ok(len) => Ok(len),
        Err(violation) => {
            write_frame(stream, violation.diagnostic(), timeouts.write, conn_deadline).await?;
            Err(ConnError::BodyLen { len: declared })
        }
    }
}

/// Deadline for the body read: a fresh budget when one is configured,
/// otherwise the header deadline keeps running.
pub fn body_deadline(timeouts: &FrameTimeouts, header_deadline: Instant, cap: Instant) -> Instant {
    match timeouts.body {
        Some(body) => deadline_within(body, cap),
        None => header_deadline,
    }
}

/// Read exactly `len` body bytes into a buffer of that size.
pub async fn read_body<R>(
    reader: &mut R,
    len: usize,
    deadline: Instant,
) -> Result<Vec<u8>, ConnError>
where
    R: AsyncRead + Unpin,
{
    let mut body = vec![0u8; len];
    read_full(reader, &mut body, ConnPhase::ReadBody, deadline).await?;
    debug!(body = %String::from_utf8_lossy(&body), "Received body");
    Ok(body)
}

/// Write one response frame with a single write call.
pub async fn write_frame<W>(
    writer: &mut W,
    body: &[u8],
    write_timeout: Duration,
    conn_deadline: Instant,
) -> Result<(), ConnError>
where
    W: AsyncWrite + Unpin,
{
    let phase = ConnPhase::WriteResponse;
    let frame = encode_frame(body)?;
    let deadline = deadline_within(write_timeout, conn_deadline);
    if Instant::now() >= deadline {
        return Err(ConnError::Timeout { phase });
    }

    let written = match timeout_at(deadline, writer.write(&frame)).await {
        Ok(Ok(n)) => n,
        Ok(Err(source)) => return Err(ConnError::Io { phase, source }),
        Err(_) => return Err(ConnError::Timeout { phase }),
    };
    if written < frame.len() {
        return Err(ConnError::ShortWrite {
            written,
            expected: frame.len(),
        });
    }

    match timeout_at(deadline, writer.flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(source)) => return Err(ConnError::Io { phase, source }),
        Err(_) => return Err(ConnError::Timeout { phase }),
    }

    debug!(len = written, body = %String::from_utf8_lossy(body), "Sent response");
    Ok(())
}

/// Errors the transport reports as worth another attempt.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Fill `buf` completely before `deadline`.
async fn read_full<R>(
    reader: &mut R,
    buf: &mut [u8],
    phase: ConnPhase,
    deadline: Instant,
) -> Result<(), ConnError>
where
    R: AsyncRead + Unpin,
{
    match timeout_at(deadline, read_retrying(reader, buf, phase)).await {
        Ok(result) => result,
        Err(_) => Err(ConnError::Timeout { phase }),
    }
}

/// Accumulate partial reads, retrying transient errors.
///
/// The retry budget is shared across the whole buffer, not reset per read.
async fn read_retrying<R>(reader: &mut R, buf: &mut [u8], phase: ConnPhase) -> Result<(), ConnError>
where
    R: AsyncRead + Unpin,
{
    let expected = buf.len();
    let mut received = 0;
    let mut retries = 0;

    while received < expected {
        match reader.read(&mut buf[received..]).await {
            Ok(0) => {
                return Err(ConnError::Eof {
                    phase,
                    received,
                    expected,
                })
            }
            Ok(n) => received += n,
            Err(e) if is_transient(&e) => {
                if retries >= MAX_READ_RETRIES {
                    return Err(ConnError::RetriesExhausted {
                        phase,
                        retries,
                        source: e,
                    });
                }
                retries += 1;
                warn!(%phase, retries, error = %e, "Transient read error, retrying");
            }
            Err(source) => return Err(ConnError::Io { phase, source }),
        }
    }

    Ok(())
}
