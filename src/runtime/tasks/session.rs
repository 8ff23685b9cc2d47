//! Per-connection session task.
//!
//! Reads chunks of at most `read_chunk` bytes and hands them to the hub,
//! while writing whatever the hub queues for this connection. The session
//! ends on EOF, on an I/O error, or when the hub evicts it. Eviction drops
//! the stream immediately, even in the middle of a stalled write.

use crate::runtime::tasks::hub::HubEvent;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Drive one connection to completion, then tell the hub it left.
pub async fn run<S>(
    id: usize,
    peer: SocketAddr,
    stream: S,
    read_chunk: usize,
    outbound: mpsc::Receiver<Bytes>,
    evict: oneshot::Receiver<()>,
    hub: mpsc::Sender<HubEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = tokio::select! {
        result = relay(id, peer, stream, read_chunk, outbound, &hub) => result,
        _ = evict => {
            debug!(conn_id = id, peer = %peer, "Evicted by hub");
            Ok(())
        }
    };
    if let Err(e) = result {
        debug!(conn_id = id, error = %e, "Connection error");
    }
    let _ = hub.send(HubEvent::Leave { id }).await;
}

async fn relay<S>(
    id: usize,
    peer: SocketAddr,
    stream: S,
    read_chunk: usize,
    mut outbound: mpsc::Receiver<Bytes>,
    hub: &mpsc::Sender<HubEvent>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; read_chunk];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    debug!(conn_id = id, "EOF");
                    break;
                }
                debug!(conn_id = id, bytes = n, "Bytes read");
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if hub.send(HubEvent::Data { id, chunk }).await.is_err() {
                    break;
                }
            }
            payload = outbound.recv() => match payload {
                Some(payload) => writer.write_all(&payload).await?,
                None => {
                    debug!(conn_id = id, "Dropped by hub");
                    break;
                }
            },
        }
    }

    match writer.shutdown().await {
        Ok(()) => {}
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {}
        Err(e) => warn!(peer = %peer, error = %e, "Unable to close socket"),
    }
    Ok(())
}
