//! fanout-relay: a TCP broadcast relay
//!
//! Every client that connects joins one shared conversation:
//! - each chunk of bytes a client sends is copied to every other client
//! - the sender gets `ok\n` back for each chunk instead of its own copy
//!
//! Features:
//! - Single-threaded readiness loop (mio) or task-per-connection (tokio) backend
//! - Bounded per-client output; clients that stop reading are disconnected
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::{Config, RuntimeType};
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
        listen = %config.listen,
        runtime = ?config.runtime,
        read_chunk = config.read_chunk,
        "Starting fanout-relay"
    );

    match config.runtime {
        RuntimeType::Mio => info!("Using mio runtime (epoll/kqueue)"),
        RuntimeType::Tasks => info!("Using tokio task runtime"),
    }

    runtime::run(config)?;
    Ok(())
}
