//! Per-connection request/response cycle.
//!
//! Each accepted socket carries exactly one exchange:
//!
//! ```text
//! Start -> ReadHeader -> ReadBody -> Dispatch -> WriteResponse -> Closed
//! ```
//!
//! Any failure jumps straight to `Closed`. The whole cycle runs under a
//! connection-wide deadline on top of the codec's per-phase deadlines, and
//! panics are contained at the task boundary so they only end the owning
//! connection.

use crate::error::ConnError;
use crate::frame::{self, FrameTimeouts};
use crate::router::Router;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, trace};

/// Current phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    /// Accepted, deadline not yet armed.
    Start,
    /// Reading the 4-byte length header.
    ReadHeader,
    /// Reading the declared number of body bytes.
    ReadBody,
    /// Running the routed handler.
    Dispatch,
    /// Writing the response frame.
    WriteResponse,
    /// Done; the socket is being closed.
    Closed,
}

impl fmt::Display for ConnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnPhase::Start => "start",
            ConnPhase::ReadHeader => "read header",
            ConnPhase::ReadBody => "read body",
            ConnPhase::Dispatch => "dispatch",
            ConnPhase::WriteResponse => "write response",
            ConnPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Timing settings every connection is served with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnSettings {
    /// Bound on the whole read -> dispatch -> write cycle.
    pub conn_timeout: Duration,
    /// Per-phase codec budgets.
    pub frame: FrameTimeouts,
}

/// A single accepted client connection.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    phase: ConnPhase,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an accepted stream in its initial `Start` phase.
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            phase: ConnPhase::Start,
        }
    }

    pub fn phase(&self) -> ConnPhase {
        self.phase
    }

    /// Run the cycle to completion and close the socket.
    ///
    /// Never panics: a panic anywhere in the cycle is caught, logged and
    /// reported as an error. No response is sent after a panic.
    pub async fn serve(
        mut self,
        settings: ConnSettings,
        router: Arc<Router>,
    ) -> Result<(), ConnError> {
        let started = Instant::now();
        info!(peer = %self.peer, "Connection accepted");

        let outcome = AssertUnwindSafe(self.exchange(&settings, &router))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(ConnError::TaskPanic {
                phase: self.phase,
                message: panic_message(panic.as_ref()),
            }),
        };

        match &result {
            Ok(()) => info!(
                peer = %self.peer,
                elapsed_us = started.elapsed().as_micros() as u64,
                "Connection completed"
            ),
            Err(e) => error!(
                peer = %self.peer,
                phase = %e.phase(),
                error = %e,
                elapsed_us = started.elapsed().as_micros() as u64,
                "Connection failed"
            ),
        }

        self.close(settings.frame.write).await;
        result
    }

    /// One read -> dispatch -> write exchange.
    async fn exchange(
        &mut self,
        settings: &ConnSettings,
        router: &Arc<Router>,
    ) -> Result<(), ConnError> {
        let conn_deadline = Instant::now() + settings.conn_timeout;
        let timeouts = &settings.frame;

        self.advance(ConnPhase::ReadHeader);
        let header_deadline = frame::deadline_within(timeouts.header, conn_deadline);
        let len =
            frame::read_header(&mut self.stream, header_deadline, timeouts, conn_deadline).await?;

        self.advance(ConnPhase::ReadBody);
        let deadline = frame::body_deadline(timeouts, header_deadline, conn_deadline);
        let request = frame::read_body(&mut self.stream, len, deadline).await?;

        self.advance(ConnPhase::Dispatch);
        let response = dispatch(router, request).await?;

        self.advance(ConnPhase::WriteResponse);
        frame::write_frame(&mut self.stream, &response, timeouts.write, conn_deadline).await?;

        Ok(())
    }

    fn advance(&mut self, next: ConnPhase) {
        trace!(peer = %self.peer, from = %self.phase, to = %next, "Phase transition");
        self.phase = next;
    }

    /// Best-effort shutdown; the socket itself is released on drop.
    async fn close(&mut self, budget: Duration) {
        self.advance(ConnPhase::Closed);
        match timeout(budget, self.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %self.peer, error = %e, "Shutdown failed"),
            Err(_) => debug!(peer = %self.peer, "Shutdown timed out"),
        }
    }
}

/// Run the router on the blocking pool so slow business logic only holds up
/// its own connection.
async fn dispatch(router: &Arc<Router>, request: Vec<u8>) -> Result<Vec<u8>, ConnError> {
    let router = Arc::clone(router);
    match tokio::task::spawn_blocking(move || router.dispatch(&request)).await {
        Ok(response) => Ok(response),
        Err(e) if e.is_panic() => Err(ConnError::HandlerPanic(panic_message(
            e.into_panic().as_ref(),
        ))),
        Err(e) => Err(ConnError::HandlerPanic(e.to_string())),
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
