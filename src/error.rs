//! Connection-scoped error taxonomy.
//!
//! Every variant here is fatal to the connection that produced it and to
//! nothing else. Transient I/O errors never surface: the frame codec retries
//! them internally and reports [`ConnError::RetriesExhausted`] once its budget
//! is spent. Routing failures never surface either; the router turns them into
//! sentinel responses.

use crate::connection::ConnPhase;
use crate::frame::MAX_BODY_LEN;
use std::io;
use thiserror::Error;

/// Why a single connection cycle ended early.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The 4-byte length header is not a decimal integer.
    #[error("malformed length header {header:?}")]
    Format { header: String },

    /// The declared body length is outside `(0, MAX_BODY_LEN]`.
    #[error("body length {len} in header outside (0, {}]", MAX_BODY_LEN)]
    BodyLen { len: i32 },

    /// A non-transient socket error.
    #[error("{phase} failed: {source}")]
    Io {
        phase: ConnPhase,
        #[source]
        source: io::Error,
    },

    /// Transient errors kept coming after the retry budget was spent.
    #[error("{phase} gave up after {retries} transient errors: {source}")]
    RetriesExhausted {
        phase: ConnPhase,
        retries: u32,
        #[source]
        source: io::Error,
    },

    /// The peer closed its side before the frame was complete.
    #[error("peer closed during {phase} after {received} of {expected} bytes")]
    Eof {
        phase: ConnPhase,
        received: usize,
        expected: usize,
    },

    /// A phase or connection deadline elapsed.
    #[error("{phase} deadline exceeded")]
    Timeout { phase: ConnPhase },

    /// A handler answered with zero bytes.
    #[error("handler returned an empty response")]
    EmptyResponse,

    /// The response length cannot be written in a 4-digit header.
    #[error("response of {len} bytes does not fit a 4-digit length header")]
    ResponseTooLong { len: usize },

    /// The socket accepted fewer bytes than the frame holds.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// Business logic panicked while producing the response.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    /// A panic outside business logic, caught at the task boundary.
    #[error("connection task panicked during {phase}: {message}")]
    TaskPanic { phase: ConnPhase, message: String },
}

impl ConnError {
    /// The phase in which the error was raised.
    pub fn phase(&self) -> ConnPhase {
        match self {
            ConnError::Io { phase, .. }
            | ConnError::RetriesExhausted { phase, .. }
            | ConnError::Eof { phase, .. }
            | ConnError::Timeout { phase }
            | ConnError::TaskPanic { phase, .. } => *phase,
            ConnError::Format { .. } | ConnError::BodyLen { .. } => ConnPhase::ReadHeader,
            ConnError::HandlerPanic(_) => ConnPhase::Dispatch,
            ConnError::EmptyResponse
            | ConnError::ResponseTooLong { .. }
            | ConnError::ShortWrite { .. } => ConnPhase::WriteResponse,
        }
    }
}
