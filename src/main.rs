//! txn-server: a framed TCP transaction server
//!
//! Features:
//! - One length-prefixed request and response per connection
//! - Routing by transaction code to named handlers
//! - Per-phase read/write deadlines and a connection-wide deadline
//! - Self-restarting listener
//! - Configuration via CLI arguments or TOML file

use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use txn_server::config::Config;
use txn_server::handlers::{build_router, HandlerCatalog};
use txn_server::server::Server;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let server_config = &config.server;
    info!(
        listen = %server_config.listen_addr(),
        workers = ?config.workers,
        conn_timeout_ms = server_config.conn_timeout().as_millis() as u64,
        read_header_timeout_ms = server_config.read_header_timeout().as_millis() as u64,
        read_body_timeout_ms = ?server_config.read_body_timeout().map(|d| d.as_millis() as u64),
        write_timeout_ms = server_config.write_timeout().as_millis() as u64,
        "Starting txn-server"
    );

    // Routes are fixed before the first accept
    let router = build_router(&config.routes, &HandlerCatalog::builtin());
    if router.is_empty() {
        warn!("No routes registered, every request will be answered as an invalid transaction");
    } else {
        info!(codes = ?router.codes(), "Route table ready");
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers.filter(|&n| n > 0) {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    let server = Server::new(config.server, Arc::new(router));
    runtime.block_on(server.run());

    Ok(())
}
