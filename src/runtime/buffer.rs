//! Per-connection outbound queue.
//!
//! Writes to a client are attempted immediately. Whatever the socket does not
//! accept is parked here as `Bytes` chunks until the connection becomes
//! writable again. The queue is bounded: a client that stops reading can
//! hold at most `limit` bytes before it is disconnected.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io::{self, Write};

/// Error returned when queued data cannot be delivered.
#[derive(Debug)]
pub enum SendError {
    /// Queued bytes would exceed the configured limit.
    Overflow {
        /// Bytes that would have been queued.
        queued: usize,
        /// Configured limit.
        limit: usize,
    },
    /// The socket write failed.
    Io(io::Error),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Overflow { queued, limit } => {
                write!(f, "outbound queue overflow: {queued} > {limit} bytes")
            }
            SendError::Io(e) => write!(f, "write failed: {e}"),
        }
    }
}

impl std::error::Error for SendError {}

impl From<io::Error> for SendError {
    fn from(e: io::Error) -> Self {
        SendError::Io(e)
    }
}

/// Bounded FIFO of pending outbound chunks.
#[derive(Debug)]
pub struct OutboundQueue {
    chunks: VecDeque<Bytes>,
    /// Total unsent bytes across all chunks.
    queued: usize,
    limit: usize,
}

impl OutboundQueue {
    /// Create an empty queue holding at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            queued: 0,
            limit,
        }
    }

    /// Number of unsent bytes.
    pub fn len(&self) -> usize {
        self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Append a chunk without writing it.
    ///
    /// Fails, leaving the queue unchanged, if the limit would be exceeded.
    pub fn push(&mut self, chunk: Bytes) -> Result<(), SendError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let queued = self.queued + chunk.len();
        if queued > self.limit {
            return Err(SendError::Overflow {
                queued,
                limit: self.limit,
            });
        }
        self.queued = queued;
        self.chunks.push_back(chunk);
        Ok(())
    }

    /// Queue `chunk` behind any pending data and write as much as the
    /// writer accepts without blocking.
    pub fn send<W: Write>(&mut self, writer: &mut W, chunk: Bytes) -> Result<(), SendError> {
        self.push(chunk)?;
        self.flush_into(writer)?;
        Ok(())
    }

    /// Write queued chunks until the queue is empty or the writer would block.
    ///
    /// Returns `true` when everything has been written.
    pub fn flush_into<W: Write>(&mut self, writer: &mut W) -> io::Result<bool> {
        while let Some(front) = self.chunks.front_mut() {
            match writer.write(&front[..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    front.advance(n);
                    self.queued -= n;
                    if front.is_empty() {
                        self.chunks.pop_front();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that accepts a fixed number of bytes, then blocks.
    struct Throttled {
        written: Vec<u8>,
        capacity: usize,
    }

    impl Throttled {
        fn new(capacity: usize) -> Self {
            Self {
                written: Vec::new(),
                capacity,
            }
        }
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.capacity - self.written.len();
            if room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = room.min(buf.len());
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_send_writes_through() {
        let mut queue = OutboundQueue::new(16);
        let mut writer = Throttled::new(64);

        queue.send(&mut writer, Bytes::from_static(b"ping")).unwrap();
        assert!(queue.is_empty());
        assert_eq!(writer.written, b"ping");
    }

    #[test]
    fn test_partial_write_is_queued_then_flushed() {
        let mut queue = OutboundQueue::new(16);
        let mut writer = Throttled::new(3);

        queue.send(&mut writer, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(writer.written, b"hel");
        assert_eq!(queue.len(), 2);

        // Later chunks stay behind the pending remainder
        queue.send(&mut writer, Bytes::from_static(b"!")).unwrap();
        assert_eq!(queue.len(), 3);

        writer.capacity = 64;
        assert!(queue.flush_into(&mut writer).unwrap());
        assert_eq!(writer.written, b"hello!");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_leaves_queue_unchanged() {
        let mut queue = OutboundQueue::new(4);
        let mut writer = Throttled::new(0);

        queue.send(&mut writer, Bytes::from_static(b"abc")).unwrap();
        assert_eq!(queue.len(), 3);

        match queue.send(&mut writer, Bytes::from_static(b"de")) {
            Err(SendError::Overflow { queued, limit }) => {
                assert_eq!(queued, 5);
                assert_eq!(limit, 4);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_empty_chunk_is_ignored() {
        let mut queue = OutboundQueue::new(1);
        queue.push(Bytes::new()).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_write_error_is_reported() {
        let mut queue = OutboundQueue::new(16);
        match queue.send(&mut Broken, Bytes::from_static(b"x")) {
            Err(SendError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
