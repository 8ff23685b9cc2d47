//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! One thread owns the listener, the poller and every connection.

mod event_loop;

pub use event_loop::EventLoop;

use crate::config::Config;

/// Run the relay using the mio backend. Returns only on a fatal error.
pub fn run(config: Config) -> std::io::Result<()> {
    EventLoop::bind(&config)?.run()
}
