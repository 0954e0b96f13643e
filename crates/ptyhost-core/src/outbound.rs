use bytes::Bytes;
use ptyhost_common::traits::AgentOutbound;
use std::collections::VecDeque;
use std::io;
use tracing::debug;

/// User-space buffer in front of the agent's write endpoint.
///
/// Tracks whether a write was taken whole by the kernel ("flushed") and owes
/// a drain notification once anything had to be queued.
#[derive(Debug, Default)]
pub struct OutboundBuffer {
    pending: VecDeque<Bytes>,
    queued: usize,
    owes_drain: bool,
}

impl OutboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    /// The chunk the next `write_ready` should carry.
    pub fn front(&self) -> Option<Bytes> {
        self.pending.front().cloned()
    }

    /// Write `data` behind anything already queued.
    ///
    /// Returns `Ok(true)` if the kernel accepted all of it right away.
    pub fn write(&mut self, sink: &mut dyn AgentOutbound, data: Bytes) -> io::Result<bool> {
        if data.is_empty() && self.pending.is_empty() {
            return Ok(true);
        }
        if self.has_pending() {
            self.enqueue(data);
            return Ok(false);
        }

        let written = write_nonblocking(sink, &data)?;
        if written == data.len() {
            return Ok(true);
        }
        debug!(written, total = data.len(), "Kernel buffer full, queueing remainder");
        self.enqueue(data.slice(written..));
        Ok(false)
    }

    /// Account for bytes of the front chunk written elsewhere.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.pending.front_mut() else {
                break;
            };
            let step = n.min(front.len());
            let _ = front.split_to(step);
            self.queued -= step;
            n -= step;
            if front.is_empty() {
                self.pending.pop_front();
            }
        }
    }

    /// Push queued bytes until the kernel refuses more.
    ///
    /// Returns `Ok(true)` exactly once per backlog: when the queue has just
    /// emptied after some write reported `false`.
    pub fn flush(&mut self, sink: &mut dyn AgentOutbound) -> io::Result<bool> {
        while let Some(front) = self.pending.front().cloned() {
            let written = write_nonblocking(sink, &front)?;
            self.advance(written);
            if written < front.len() {
                return Ok(false);
            }
        }
        Ok(self.take_drain())
    }

    /// Discard everything queued. Returns the number of bytes dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queued;
        self.pending.clear();
        self.queued = 0;
        self.owes_drain = false;
        dropped
    }

    fn take_drain(&mut self) -> bool {
        if self.pending.is_empty() && self.owes_drain {
            self.owes_drain = false;
            return true;
        }
        false
    }

    fn enqueue(&mut self, data: Bytes) {
        self.owes_drain = true;
        if data.is_empty() {
            return;
        }
        self.queued += data.len();
        self.pending.push_back(data);
    }
}

/// Write as much of `buf` as the sink takes without waiting.
fn write_nonblocking(sink: &mut dyn AgentOutbound, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match sink.try_write(&buf[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Sink that accepts at most `room` bytes until `free` is called.
    struct CappedSink {
        room: usize,
        accepted: Vec<u8>,
    }

    impl CappedSink {
        fn new(room: usize) -> Self {
            Self {
                room,
                accepted: Vec::new(),
            }
        }

        fn free(&mut self, n: usize) {
            self.room += n;
        }
    }

    #[async_trait]
    impl AgentOutbound for CappedSink {
        fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.room);
            self.room -= n;
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        async fn write_ready(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.try_write(buf)
        }
    }

    #[test]
    fn test_small_write_is_flushed() {
        let mut sink = CappedSink::new(16);
        let mut buffer = OutboundBuffer::new();
        assert!(buffer.write(&mut sink, Bytes::from_static(b"ls\r")).unwrap());
        assert!(!buffer.has_pending());
        assert!(!buffer.flush(&mut sink).unwrap(), "no drain without a partial write");
    }

    #[test]
    fn test_partial_write_owes_drain() {
        let mut sink = CappedSink::new(4);
        let mut buffer = OutboundBuffer::new();
        assert!(!buffer.write(&mut sink, Bytes::from_static(b"abcdefgh")).unwrap());
        assert_eq!(buffer.queued_bytes(), 4);

        assert!(!buffer.flush(&mut sink).unwrap());
        sink.free(2);
        assert!(!buffer.flush(&mut sink).unwrap());
        sink.free(10);
        assert!(buffer.flush(&mut sink).unwrap());
        assert!(!buffer.flush(&mut sink).unwrap(), "drain is reported once");
        assert_eq!(sink.accepted, b"abcdefgh");
    }

    #[test]
    fn test_later_writes_queue_behind_backlog() {
        let mut sink = CappedSink::new(2);
        let mut buffer = OutboundBuffer::new();
        assert!(!buffer.write(&mut sink, Bytes::from_static(b"1234")).unwrap());
        sink.free(100);
        // Room is available again but ordering forces the queue.
        assert!(!buffer.write(&mut sink, Bytes::from_static(b"56")).unwrap());
        assert!(buffer.flush(&mut sink).unwrap());
        assert_eq!(sink.accepted, b"123456");
    }

    #[test]
    fn test_advance_across_chunks() {
        let mut sink = CappedSink::new(0);
        let mut buffer = OutboundBuffer::new();
        buffer.write(&mut sink, Bytes::from_static(b"abc")).unwrap();
        buffer.write(&mut sink, Bytes::from_static(b"def")).unwrap();
        buffer.advance(4);
        assert_eq!(buffer.queued_bytes(), 2);
        assert_eq!(buffer.front().unwrap(), Bytes::from_static(b"ef"));
    }

    #[test]
    fn test_clear_forgets_drain() {
        let mut sink = CappedSink::new(0);
        let mut buffer = OutboundBuffer::new();
        buffer.write(&mut sink, Bytes::from_static(b"abc")).unwrap();
        assert_eq!(buffer.clear(), 3);
        assert!(!buffer.flush(&mut sink).unwrap());
    }
}
