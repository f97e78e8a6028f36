//! line-relay: A single-threaded TCP line-chat relay
//!
//! Every connected peer may send newline-terminated lines. Each completed
//! line is relayed to every connected peer, the sender included, as
//! `{sender address}: {line}\n`.
//!
//! Features:
//! - One thread, one readiness loop (epoll/kqueue via mio)
//! - Per-peer failure isolation: a failed read or send only drops that peer
//! - Optional connection and line-length limits
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

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

    info!(
        host = %config.listen,
        port = config.port,
        backlog = config.backlog,
        max_connections = ?config.max_connections,
        max_line_length = ?config.max_line_length,
        "Starting line-relay"
    );

    runtime::run(&config)?;
    Ok(())
}
