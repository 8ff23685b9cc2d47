//! Task-per-connection backend on tokio.
//!
//! Runs on a current-thread runtime, so the relay is still single threaded.
//! Each connection gets a session task. The member set lives in one hub
//! task and is only ever changed through messages to it.

mod hub;
mod session;

use crate::config::Config;
use crate::runtime::listener::{create_listener, parse_addr};
use bytes::Bytes;
use hub::{Hub, HubEvent};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

/// Capacity of the channel into the hub.
const HUB_QUEUE: usize = 1024;

/// Pause after a failed accept (e.g. EMFILE) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Run the relay using the task backend. Returns only on a fatal error.
pub fn run(config: Config) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let listener = bind(&config)?;
        serve(listener, &config).await
    })
}

/// Bind the listening socket. Must be called inside the runtime.
pub fn bind(config: &Config) -> io::Result<TcpListener> {
    let addr = parse_addr(&config.listen)?;
    info!(addr = %addr, "Opening port");
    let listener = TcpListener::from_std(create_listener(addr)?)?;
    info!(
        addr = %listener.local_addr()?,
        read_chunk = config.read_chunk,
        outbound_limit = config.outbound_limit,
        max_connections = ?config.max_connections,
        "Listening"
    );
    Ok(listener)
}

/// Outbound messages a member may have queued before it is dropped.
fn queue_depth(config: &Config) -> usize {
    (config.outbound_limit / config.read_chunk).max(1)
}

/// Accept connections forever, spawning a session for each.
pub async fn serve(listener: TcpListener, config: &Config) -> io::Result<()> {
    let (hub_tx, hub_rx) = mpsc::channel(HUB_QUEUE);
    tokio::spawn(Hub::new(config.max_connections).run(hub_rx));

    let depth = queue_depth(config);
    let mut next_id = 0usize;

    loop {
        let (stream, peer) = accept_with_backoff(|| listener.accept()).await;

        let id = next_id;
        next_id = next_id.wrapping_add(1);

        let (out_tx, out_rx) = mpsc::channel::<Bytes>(depth);
        let (evict_tx, evict_rx) = oneshot::channel();
        // Join is queued before the session can send any data
        hub_tx
            .send(HubEvent::Join {
                id,
                peer,
                outbound: out_tx,
                evict: evict_tx,
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "hub stopped"))?;

        tokio::spawn(session::run(
            id,
            peer,
            stream,
            config.read_chunk,
            out_rx,
            evict_rx,
            hub_tx.clone(),
        ));
    }
}

/// Retry `accept` until it succeeds, sleeping between failures so a
/// persistent error does not spin the loop.
async fn accept_with_backoff<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                error!(error = %e, "Accept error");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
