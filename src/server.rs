//! TCP server for framed transaction requests.
//!
//! Binds the listener, accepts connections and spawns one task per
//! connection. A listener that fails is rebuilt by the outer loop, so the
//! service keeps running without outside intervention.

use crate::config::ServerConfig;
use crate::connection::{panic_message, ConnSettings, Connection};
use crate::router::Router;
use futures::FutureExt;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// First pause after a transient accept error.
const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);

/// Longest pause between accept attempts.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pending connection queue length passed to `listen(2)`.
const LISTEN_BACKLOG: i32 = 1024;

/// Errors that end one serve cycle.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to resolve listen address '{addr}': {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind '{addr}': {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("serve cycle panicked: {0}")]
    Panic(String),
}

/// Exponential backoff for transient accept errors: 5ms doubling to 1s.
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pause before the next accept attempt.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => ACCEPT_BACKOFF_INITIAL,
            Some(delay) => (delay * 2).min(ACCEPT_BACKOFF_MAX),
        };
        self.current = Some(next);
        next
    }

    /// Start over after a successful accept.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Accept errors that say nothing about the listener itself.
pub fn is_transient_accept_error(e: &io::Error) -> bool {
    if matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    ) {
        return true;
    }
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Server instance
#[derive(Debug, Clone)]
pub struct Server {
    config: ServerConfig,
    settings: ConnSettings,
    router: Arc<Router>,
}

impl Server {
    /// Create a server around a fully registered router.
    pub fn new(config: ServerConfig, router: Arc<Router>) -> Self {
        let settings = config.conn_settings();
        Server {
            config,
            settings,
            router,
        }
    }

    /// Serve forever, rebuilding the listener whenever a serve cycle ends.
    pub async fn run(&self) {
        loop {
            let outcome = AssertUnwindSafe(self.serve()).catch_unwind().await;
            let err = match outcome {
                Ok(Err(e)) => e,
                Ok(Ok(never)) => match never {},
                Err(panic) => ServeError::Panic(panic_message(panic.as_ref())),
            };
            error!(error = %err, "Serve cycle ended");

            // a failed bind never suspends, so always give other tasks a turn
            if self.config.restart_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.config.restart_delay).await;
            }
            info!("Server restart");
        }
    }

    /// One serve cycle: bind, then accept until the listener fails.
    async fn serve(&self) -> Result<std::convert::Infallible, ServeError> {
        let addr = self.config.listen_addr();
        let listener = bind(&addr).await?;
        info!(address = %addr, "Server listening");
        self.serve_listener(listener).await
    }

    /// Accept on an already bound listener until a non-transient error.
    pub async fn serve_listener(
        &self,
        listener: TcpListener,
    ) -> Result<std::convert::Infallible, ServeError> {
        let mut backoff = AcceptBackoff::new();

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    backoff.reset();
                    debug!(peer = %peer, "New connection");

                    let settings = self.settings;
                    let router = Arc::clone(&self.router);
                    // One task per connection, no admission limit.
                    tokio::spawn(async move {
                        let _ = Connection::new(stream, peer).serve(settings, router).await;
                    });
                }
                Err(e) if is_transient_accept_error(&e) => {
                    let delay = backoff.next_delay();
                    error!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Accept failed, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(ServeError::Accept(e)),
            }
        }
    }
}

/// Bind a listener with `SO_REUSEADDR` so a restarted cycle can rebind at once.
pub async fn bind(addr: &str) -> Result<TcpListener, ServeError> {
    let resolve_err = |source| ServeError::Resolve {
        addr: addr.to_string(),
        source,
    };
    let socket_addr = tokio::net::lookup_host(addr)
        .await
        .map_err(resolve_err)?
        .next()
        .ok_or_else(|| {
            resolve_err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no addresses resolved",
            ))
        })?;

    let bind_err = |source| ServeError::Bind {
        addr: addr.to_string(),
        source,
    };
    let socket = Socket::new(
        Domain::for_address(socket_addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&socket_addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

    TcpListener::from_std(socket.into()).map_err(bind_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use crate::handlers::{echo, p1001};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn router() -> Arc<Router> {
        let mut router = Router::new();
        router.register("1001", p1001).unwrap();
        router.register("echo", echo).unwrap();
        router
            .register("boom", |_: &[u8]| -> Vec<u8> { panic!("handler exploded") })
            .unwrap();
        Arc::new(router)
    }

    async fn start(config: ServerConfig) -> SocketAddr {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(config, router());
        tokio::spawn(async move {
            let _ = server.serve_listener(listener).await;
        });
        addr
    }

    async fn send_raw(addr: SocketAddr, bytes: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(bytes).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    }

    async fn request(addr: SocketAddr, body: &[u8]) -> Vec<u8> {
        send_raw(addr, &encode_frame(body).unwrap()).await
    }

    #[test]
    fn test_accept_backoff() {
        let mut backoff = AcceptBackoff::new();
        let delays: Vec<u64> = (0..10)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(
            libc::EMFILE
        )));
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::InvalidInput
        )));
        assert!(!is_transient_accept_error(&io::Error::from_raw_os_error(
            libc::EBADF
        )));
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        match bind(&addr).await {
            Err(ServeError::Bind { addr: failed, source }) => {
                assert_eq!(failed, addr);
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_1001() {
        let addr = start(ServerConfig::new("127.0.0.1:0")).await;

        let response = send_raw(addr, b"0034{\"TransCode\":\"1001\",\"test\":\"test\"}").await;
        let expected = br#"{"ret":0,"msg":"succ","test":"hello 1001 test"}"#;
        assert_eq!(&response[..4], format!("{:04}", expected.len()).as_bytes());
        assert_eq!(&response[4..], expected);
    }

    #[tokio::test]
    async fn test_sentinel_responses() {
        let addr = start(ServerConfig::new("127.0.0.1:0")).await;

        let response = request(addr, br#"{"TransCode":"7777"}"#).await;
        assert_eq!(response, b"0019invalid transaction");

        let response = request(addr, b"plain text").await;
        assert_eq!(response, b"0021transcode parse error");
    }

    #[tokio::test]
    async fn test_length_diagnostics() {
        let addr = start(ServerConfig::new("127.0.0.1:0")).await;

        assert_eq!(send_raw(addr, b"0000").await, b"0024body len in head is zero");
        assert_eq!(send_raw(addr, b"-003").await, b"0024body len in head is zero");
        assert_eq!(send_raw(addr, b"9217").await, b"0026body len in head, too long");
        assert!(send_raw(addr, b"x123").await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_clients_get_their_own_responses() {
        let addr = start(ServerConfig::new("127.0.0.1:0")).await;

        let clients: Vec<_> = (0..32)
            .map(|i| {
                tokio::spawn(async move {
                    let body = format!(r#"{{"TransCode":"echo","client":{i}}}"#);
                    let mut stream = TcpStream::connect(addr).await.unwrap();
                    let frame = encode_frame(body.as_bytes()).unwrap();
                    // interleave at the socket level
                    let (head, tail) = frame.split_at(6);
                    stream.write_all(head).await.unwrap();
                    tokio::task::yield_now().await;
                    stream.write_all(tail).await.unwrap();

                    let mut response = Vec::new();
                    stream.read_to_end(&mut response).await.unwrap();
                    (frame.to_vec(), response)
                })
            })
            .collect();

        for client in clients {
            let (sent, received) = client.await.unwrap();
            assert_eq!(sent, received);
        }
    }

    #[tokio::test]
    async fn test_stalled_client_is_closed_and_others_served() {
        let config = ServerConfig {
            conn_timeout: Duration::from_millis(200),
            ..ServerConfig::new("127.0.0.1:0")
        };
        let addr = start(config).await;

        let mut stalled = TcpStream::connect(addr).await.unwrap();
        stalled.write_all(b"00").await.unwrap();

        let response = request(addr, br#"{"TransCode":"echo"}"#).await;
        assert_eq!(response, b"0020{\"TransCode\":\"echo\"}");

        let mut buf = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), stalled.read_to_end(&mut buf))
            .await
            .expect("server should close the stalled connection");
        assert_eq!(closed.unwrap(), 0);

        let response = request(addr, br#"{"TransCode":"echo"}"#).await;
        assert_eq!(response, b"0020{\"TransCode\":\"echo\"}");
    }

    /// Start `run()` on a port another listener holds, release it after
    /// `hold`, and check the server rebinds and answers.
    async fn assert_rebinds_after_bind_failure(restart_delay: Duration, hold: Duration) {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = blocker.local_addr().unwrap();

        let config = ServerConfig {
            restart_delay,
            ..ServerConfig::new(addr.to_string())
        };
        let server = Server::new(config, router());
        let running = tokio::spawn(async move { server.run().await });

        tokio::time::sleep(hold).await;
        drop(blocker);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let response = tokio::time::timeout(
            Duration::from_secs(5),
            request(addr, br#"{"TransCode":"echo"}"#),
        )
        .await
        .expect("server should have rebound the released port");
        assert_eq!(response, b"0020{\"TransCode\":\"echo\"}");
        assert!(!running.is_finished());
        running.abort();
    }

    #[tokio::test]
    async fn test_run_restarts_after_bind_failure() {
        assert_rebinds_after_bind_failure(Duration::from_millis(20), Duration::from_millis(100))
            .await;
    }

    #[tokio::test]
    async fn test_run_without_restart_delay_does_not_starve_runtime() {
        // single-threaded runtime: a restart loop that never yields would
        // keep this task from waking up at all
        assert_rebinds_after_bind_failure(Duration::ZERO, Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_handler_panic_only_affects_its_connection() {
        let addr = start(ServerConfig::new("127.0.0.1:0")).await;

        assert!(request(addr, br#"{"TransCode":"boom"}"#).await.is_empty());

        let response = request(addr, br#"{"TransCode":"echo"}"#).await;
        assert_eq!(response, b"0020{\"TransCode\":\"echo\"}");
    }
}
