//! Single-threaded relay runtime.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS). One
//! thread owns the listener, every connection and the registry, so no
//! locking is involved anywhere.
//!
//! Shared abstractions:
//! - `GrowableBuffer`: per-connection line accumulation
//! - `Connection`: socket plus line framer
//! - `ConnectionRegistry`: ordered and keyed views of live connections

mod buffer;
mod connection;
mod mio;

pub(crate) use buffer::GrowableBuffer;
pub(crate) use connection::{CloseReason, Connection, ConnectionRegistry};
pub(crate) use self::mio::Multiplexer;

use crate::config::Config;
use tracing::info;

/// Bind the listener and serve until the process is terminated.
pub fn run(config: &Config) -> std::io::Result<()> {
    let mut multiplexer = Multiplexer::bind(config)?;
    info!(addr = %multiplexer.local_addr(), "Listening");
    multiplexer.run()
}
