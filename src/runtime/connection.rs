//! Live client connections and the registry that owns them.
//!
//! Every connection in the registry is registered with the poller, and
//! nothing is registered with the poller that is not in the registry.
//! `ConnectionRegistry::insert` and `ConnectionRegistry::remove` are the only
//! ways to change either side.

use crate::runtime::buffer::{OutboundQueue, SendError};
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::io;
use std::net::{Shutdown, SocketAddr};
use tracing::{debug, warn};

/// A single accepted client.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    outbound: OutboundQueue,
    /// Interest currently registered with the poller.
    interest: Interest,
}

impl Connection {
    /// Wrap an accepted stream. Data queued for it is capped at `outbound_limit` bytes.
    pub fn new(stream: TcpStream, peer: SocketAddr, outbound_limit: usize) -> Self {
        Self {
            stream,
            peer,
            outbound: OutboundQueue::new(outbound_limit),
            interest: Interest::READABLE,
        }
    }

    /// Remote address, for diagnostics.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Mutable access to the socket for reading.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Write `chunk` now, queueing whatever the socket does not take.
    pub fn send(&mut self, chunk: Bytes) -> Result<(), SendError> {
        self.outbound.send(&mut self.stream, chunk)
    }

    /// Write pending data. Returns `true` once nothing is left.
    pub fn flush(&mut self) -> io::Result<bool> {
        self.outbound.flush_into(&mut self.stream)
    }

    /// Bytes waiting to be written.
    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    fn wanted_interest(&self) -> Interest {
        if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Release the socket. Failures are reported and otherwise ignored.
    pub fn close(self) {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => {}
            // Peer already gone
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => warn!(peer = %self.peer, error = %e, "Unable to close socket"),
        }
    }
}

/// Insertion-ordered set of live connections.
///
/// Slab storage gives O(1) lookup by poll token; `order` keeps accept order
/// for broadcast fan-out.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    order: Vec<usize>,
    max_connections: Option<usize>,
}

impl ConnectionRegistry {
    /// Create a new registry, optionally capped at `max_connections`.
    pub fn new(max_connections: Option<usize>) -> Self {
        Self {
            connections: Slab::new(),
            order: Vec::new(),
            max_connections,
        }
    }

    /// Whether the connection cap has been reached.
    pub fn is_full(&self) -> bool {
        self.max_connections
            .is_some_and(|max| self.connections.len() >= max)
    }

    /// Register `conn` with the poller for reads and add it to the registry.
    ///
    /// On registration failure the connection is dropped and nothing changes.
    pub fn insert(&mut self, registry: &Registry, mut conn: Connection) -> io::Result<usize> {
        let entry = self.connections.vacant_entry();
        let id = entry.key();
        registry.register(&mut conn.stream, Token(id), conn.interest)?;
        entry.insert(conn);
        self.order.push(id);
        Ok(id)
    }

    /// Deregister and remove a connection. Unknown ids are ignored.
    pub fn remove(&mut self, registry: &Registry, id: usize) -> Option<Connection> {
        let mut conn = self.connections.try_remove(id)?;
        self.order.retain(|&other| other != id);
        if let Err(e) = registry.deregister(&mut conn.stream) {
            warn!(conn_id = id, peer = %conn.peer, error = %e, "Failed to deregister connection");
        }
        Some(conn)
    }

    /// Re-register `id` if its pending output changed the interest it needs.
    pub fn sync_interest(&mut self, registry: &Registry, id: usize) -> io::Result<()> {
        let conn = match self.connections.get_mut(id) {
            Some(conn) => conn,
            None => return Ok(()),
        };
        let wanted = conn.wanted_interest();
        if wanted != conn.interest {
            registry.reregister(&mut conn.stream, Token(id), wanted)?;
            debug!(conn_id = id, writable = wanted.is_writable(), "Interest changed");
            conn.interest = wanted;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connection ids in accept order.
    pub fn ids(&self) -> Vec<usize> {
        self.order.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use mio::Poll;
    use std::io::Read;
    use std::time::Duration;

    fn accept_one(listener: &TcpListener) -> (TcpStream, SocketAddr) {
        for _ in 0..500 {
            match listener.accept() {
                Ok(accepted) => return accepted,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        panic!("no connection accepted");
    }

    fn setup() -> (Poll, TcpListener) {
        let poll = Poll::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        (poll, listener)
    }

    fn connect(listener: &TcpListener) -> (std::net::TcpStream, Connection) {
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = accept_one(listener);
        (client, Connection::new(stream, peer, 1024))
    }

    #[test]
    fn test_registry_preserves_accept_order() {
        let (poll, listener) = setup();
        let mut registry = ConnectionRegistry::new(None);

        let (_a, conn_a) = connect(&listener);
        let (_b, conn_b) = connect(&listener);
        let (_c, conn_c) = connect(&listener);

        let a = registry.insert(poll.registry(), conn_a).unwrap();
        let b = registry.insert(poll.registry(), conn_b).unwrap();
        let c = registry.insert(poll.registry(), conn_c).unwrap();
        assert_eq!(registry.ids(), vec![a, b, c]);

        // Slab reuses the freed slot, but the newcomer goes to the back
        registry.remove(poll.registry(), a).unwrap().close();
        let (_d, conn_d) = connect(&listener);
        let d = registry.insert(poll.registry(), conn_d).unwrap();
        assert_eq!(d, a);
        assert_eq!(registry.ids(), vec![b, c, d]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_failed_register_leaves_registry_unchanged() {
        let (poll, listener) = setup();
        let mut registry = ConnectionRegistry::new(None);

        let (_a, conn_a) = connect(&listener);
        let a = registry.insert(poll.registry(), conn_a).unwrap();

        // epoll rejects a second registration of the same fd with EEXIST
        let (_b, mut conn_b) = connect(&listener);
        poll.registry()
            .register(conn_b.stream_mut(), Token(99), Interest::READABLE)
            .unwrap();
        assert!(registry.insert(poll.registry(), conn_b).is_err());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ids(), vec![a]);

        // The slot handed out during the failed insert is still free
        let (_c, conn_c) = connect(&listener);
        let c = registry.insert(poll.registry(), conn_c).unwrap();
        assert_eq!(c, a + 1);
        assert_eq!(registry.ids(), vec![a, c]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (poll, listener) = setup();
        let mut registry = ConnectionRegistry::new(None);

        let (_client, conn) = connect(&listener);
        let id = registry.insert(poll.registry(), conn).unwrap();

        assert!(registry.remove(poll.registry(), id).is_some());
        assert!(registry.remove(poll.registry(), id).is_none());
        assert!(!registry.contains(id));
        assert!(registry.is_empty());
        assert!(registry.ids().is_empty());
    }

    #[test]
    fn test_connection_cap() {
        let (poll, listener) = setup();
        let mut registry = ConnectionRegistry::new(Some(1));
        assert!(!registry.is_full());

        let (_client, conn) = connect(&listener);
        registry.insert(poll.registry(), conn).unwrap();
        assert!(registry.is_full());
    }

    #[test]
    fn test_send_reaches_peer() {
        let (poll, listener) = setup();
        let mut registry = ConnectionRegistry::new(None);

        let (mut client, conn) = connect(&listener);
        let id = registry.insert(poll.registry(), conn).unwrap();

        let conn = registry.get_mut(id).unwrap();
        conn.send(Bytes::from_static(b"ok\n")).unwrap();
        assert_eq!(conn.pending(), 0);
        registry.sync_interest(poll.registry(), id).unwrap();

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok\n");
    }

    #[test]
    fn test_close_after_peer_reset_does_not_panic() {
        let (_poll, listener) = setup();
        let (client, conn) = connect(&listener);
        drop(client);
        conn.close();
    }
}
