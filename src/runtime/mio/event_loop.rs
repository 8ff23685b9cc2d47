//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking accept/read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Chunked relay
//!
//! Every successful read of at most `read_chunk` bytes is relayed on its
//! own: the sender gets `ok\n` and every other client gets a copy of exactly
//! those bytes. mio readiness is edge-triggered, so a readable connection is
//! read chunk by chunk until it would block. To keep one busy client from
//! starving the rest, at most `read_budget` chunks are taken per event; a
//! connection that still has data waiting goes on a backlog that is revisited
//! on the next turn without blocking in poll.

use crate::config::Config;
use crate::runtime::buffer::SendError;
use crate::runtime::listener::{create_listener, parse_addr};
use crate::runtime::{Connection, ConnectionRegistry, ACK};
use bytes::Bytes;
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token};
use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Events processed per poll.
const EVENTS_CAPACITY: usize = 1024;

/// Single-threaded relay driven by a mio `Poll`.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    relay: Relay,
}

/// Everything the dispatcher mutates. Kept apart from `Poll` so the
/// registry handle can be borrowed while events are handled.
struct Relay {
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionRegistry,
    /// Scratch space for one read; contents never outlive the event.
    read_buf: Box<[u8]>,
    read_budget: usize,
    outbound_limit: usize,
    /// Connections whose read budget ran out with data still pending.
    backlog: VecDeque<usize>,
}

impl EventLoop {
    /// Bind the listening socket and register it with a fresh poller.
    ///
    /// Failure here is fatal to the caller: there is no retry.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = parse_addr(&config.listen)?;
        info!(addr = %addr, "Opening port");

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            read_chunk = config.read_chunk,
            read_budget = config.read_budget,
            outbound_limit = config.outbound_limit,
            max_connections = ?config.max_connections,
            "Listening"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            relay: Relay {
                listener,
                local_addr,
                connections: ConnectionRegistry::new(config.max_connections),
                read_buf: vec![0u8; config.read_chunk].into_boxed_slice(),
                read_budget: config.read_budget,
                outbound_limit: config.outbound_limit,
                backlog: VecDeque::new(),
            },
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.relay.local_addr
    }

    /// Number of live client connections.
    pub fn connection_count(&self) -> usize {
        self.relay.connections.len()
    }

    /// Serve clients forever. Returns only if polling fails.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.turn(None)?;
        }
    }

    /// Wait for readiness (at most `timeout`, `None` = forever) and dispatch
    /// every reported event once.
    ///
    /// Backlogged connections force a zero timeout and are serviced after
    /// the fresh events.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let backlog = std::mem::take(&mut self.relay.backlog);
        let timeout = if backlog.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                self.relay.backlog = backlog;
                return Ok(());
            }
            return Err(e);
        }

        let registry = self.poll.registry();
        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.relay.accept_connections(registry),
                Token(conn_id) => self.relay.handle_connection_event(registry, conn_id, event),
            }
        }

        for conn_id in backlog {
            if self.relay.connections.contains(conn_id) {
                self.relay.handle_readable(registry, conn_id);
            }
        }

        Ok(())
    }
}

impl Relay {
    /// Accept every pending connection.
    ///
    /// Errors other than `WouldBlock` end this accept batch but never the loop.
    fn accept_connections(&mut self, registry: &Registry) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.is_full() {
                        warn!(peer = %peer, "Connection limit reached, rejecting");
                        continue;
                    }

                    // mio hands out non-blocking sockets
                    let conn = Connection::new(stream, peer, self.outbound_limit);
                    match self.connections.insert(registry, conn) {
                        Ok(conn_id) => info!(
                            conn_id,
                            peer = %peer,
                            clients = self.connections.len(),
                            "Connection accepted"
                        ),
                        Err(e) => warn!(peer = %peer, error = %e, "Failed to register connection"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, registry: &Registry, conn_id: usize, event: &Event) {
        if !self.connections.contains(conn_id) {
            return;
        }

        if event.is_writable() {
            if let Err(e) = self.flush(registry, conn_id) {
                debug!(conn_id, error = %e, "Flush failed");
                self.close_connection(registry, conn_id);
                return;
            }
        }

        // Peer close and socket errors surface through read()
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.handle_readable(registry, conn_id);
        }
    }

    fn flush(&mut self, registry: &Registry, conn_id: usize) -> io::Result<()> {
        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.flush()?;
        }
        self.connections.sync_interest(registry, conn_id)
    }

    /// Read up to `read_budget` chunks from one connection, relaying each.
    fn handle_readable(&mut self, registry: &Registry, conn_id: usize) {
        for _ in 0..self.read_budget {
            let conn = match self.connections.get_mut(conn_id) {
                Some(conn) => conn,
                None => return,
            };

            let n = match conn.stream_mut().read(&mut self.read_buf) {
                Ok(0) => {
                    debug!(conn_id, "EOF");
                    self.close_connection(registry, conn_id);
                    return;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn_id, error = %e, "Read error");
                    self.close_connection(registry, conn_id);
                    return;
                }
            };

            debug!(conn_id, bytes = n, "Bytes read");
            let chunk = Bytes::copy_from_slice(&self.read_buf[..n]);
            self.broadcast(registry, conn_id, chunk);
        }

        if self.connections.contains(conn_id) && !self.backlog.contains(&conn_id) {
            self.backlog.push_back(conn_id);
        }
    }

    /// Acknowledge `source` and hand `chunk` to every other connection.
    ///
    /// A target that cannot take its payload is torn down on its own; the
    /// remaining targets are still served.
    fn broadcast(&mut self, registry: &Registry, source: usize, chunk: Bytes) {
        let mut failed = Vec::new();

        for conn_id in self.connections.ids() {
            let payload = if conn_id == source {
                Bytes::from_static(ACK)
            } else {
                chunk.clone()
            };

            let conn = match self.connections.get_mut(conn_id) {
                Some(conn) => conn,
                None => continue,
            };
            let result = conn.send(payload).and_then(|()| {
                self.connections
                    .sync_interest(registry, conn_id)
                    .map_err(SendError::from)
            });

            if let Err(e) = result {
                failed.push((conn_id, e));
            }
        }

        for (conn_id, e) in failed {
            match e {
                SendError::Overflow { .. } => {
                    warn!(conn_id, error = %e, "Dropping slow receiver")
                }
                SendError::Io(_) => debug!(conn_id, error = %e, "Write error"),
            }
            self.close_connection(registry, conn_id);
        }
    }

    /// Tear down one connection. Unknown ids are a no-op.
    fn close_connection(&mut self, registry: &Registry, conn_id: usize) {
        if let Some(conn) = self.connections.remove(registry, conn_id) {
            info!(
                conn_id,
                peer = %conn.peer(),
                unsent = conn.pending(),
                clients = self.connections.len(),
                "Closing connection"
            );
            conn.close();
        }
    }
}
