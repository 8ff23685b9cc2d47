//! Hub task: the single owner of the member set.
//!
//! Sessions never touch each other. They report joins, received chunks and
//! departures over one channel, and the hub fans chunks out through each
//! member's bounded outbound channel. A member whose channel is full is
//! evicted rather than waited on: its close signal fires and the session
//! drops the socket, even while stuck writing to a peer that never reads.

use crate::runtime::ACK;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Messages from the accept loop and sessions to the hub.
#[derive(Debug)]
pub enum HubEvent {
    /// A new connection wants to receive broadcasts.
    Join {
        id: usize,
        peer: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
        /// Fired when the hub evicts the member.
        evict: oneshot::Sender<()>,
    },
    /// Bytes read from a member, to be relayed.
    Data { id: usize, chunk: Bytes },
    /// The member's session has ended.
    Leave { id: usize },
}

struct Member {
    id: usize,
    peer: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    evict: oneshot::Sender<()>,
}

/// Insertion-ordered member set.
pub struct Hub {
    members: Vec<Member>,
    max_connections: Option<usize>,
}

impl Hub {
    pub fn new(max_connections: Option<usize>) -> Self {
        Self {
            members: Vec::new(),
            max_connections,
        }
    }

    /// Process events until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<HubEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        debug!("Hub stopped");
    }

    pub fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Join {
                id,
                peer,
                outbound,
                evict,
            } => {
                self.join(Member {
                    id,
                    peer,
                    outbound,
                    evict,
                });
            }
            HubEvent::Data { id, chunk } => self.publish(id, chunk),
            HubEvent::Leave { id } => {
                if let Some(member) = self.take(id) {
                    info!(
                        conn_id = id,
                        peer = %member.peer,
                        clients = self.len(),
                        "Closing connection"
                    );
                }
            }
        }
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    fn contains(&self, id: usize) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    /// Add a member. Over the connection cap it is evicted straight away.
    fn join(&mut self, member: Member) {
        if self.max_connections.is_some_and(|max| self.len() >= max) {
            warn!(peer = %member.peer, "Connection limit reached, rejecting");
            let _ = member.evict.send(());
            return;
        }
        info!(
            conn_id = member.id,
            peer = %member.peer,
            clients = self.len() + 1,
            "Connection accepted"
        );
        self.members.push(member);
    }

    /// Remove a member without signalling it. Unknown ids yield `None`.
    fn take(&mut self, id: usize) -> Option<Member> {
        let pos = self.members.iter().position(|m| m.id == id)?;
        Some(self.members.remove(pos))
    }

    /// Acknowledge `source` and queue `chunk` for every other member.
    fn publish(&mut self, source: usize, chunk: Bytes) {
        // Sender already dropped; nothing to acknowledge
        if !self.contains(source) {
            return;
        }

        let ack = Bytes::from_static(ACK);
        let mut evicted = Vec::new();
        for member in &self.members {
            let payload = if member.id == source {
                ack.clone()
            } else {
                chunk.clone()
            };
            match member.outbound.try_send(payload) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(conn_id = member.id, peer = %member.peer, "Dropping slow receiver");
                    evicted.push(member.id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(conn_id = member.id, "Session gone");
                    evicted.push(member.id);
                }
            }
        }

        for id in evicted {
            if let Some(member) = self.take(id) {
                let _ = member.evict.send(());
            }
        }
    }
}
