//! Relay runtimes.
//!
//! Two interchangeable backends serve the same wire behaviour:
//! - `mio`: a single-threaded readiness loop (epoll/kqueue)
//! - `tasks`: tokio tasks on a current-thread runtime, with one hub task
//!   owning the set of members
//!
//! Both share:
//! - `create_listener`: socket2-built listening socket
//! - `ACK`: the reply a sender receives for every chunk it sends

mod buffer;
mod connection;
mod listener;
pub mod mio;
pub mod tasks;

pub(crate) use connection::{Connection, ConnectionRegistry};

use crate::config::{Config, RuntimeType};

/// Acknowledgment sent back to the sender of each relayed chunk.
pub const ACK: &[u8] = b"ok\n";

/// Run the relay with the configured backend.
pub fn run(config: Config) -> std::io::Result<()> {
    match config.runtime {
        RuntimeType::Mio => mio::run(config),
        RuntimeType::Tasks => tasks::run(config),
    }
}
