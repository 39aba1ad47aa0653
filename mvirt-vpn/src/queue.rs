//! Unbounded MPMC queues between the pump and the protocol handlers.

use crossbeam_queue::SegQueue;

use crate::buffer::Buffer;
use crate::packet::Packet;

/// Lock-free FIFO queue, safe for any number of producers and consumers.
pub struct PacketQueue<T> {
    inner: SegQueue<T>,
}

/// Device-to-network UDP packets (pump produces).
pub type UdpQueue = PacketQueue<Packet>;

/// Device-to-network TCP packets (pump produces).
pub type TcpQueue = PacketQueue<Packet>;

/// Network-to-device raw packets (pump consumes). Buffers must be in write
/// mode with the packet bytes before `position`; the pump flips them.
pub type InboundQueue = PacketQueue<Buffer>;

impl<T> PacketQueue<T> {
    pub fn new() -> Self {
        PacketQueue {
            inner: SegQueue::new(),
        }
    }

    #[inline]
    pub fn push(&self, item: T) {
        self.inner.push(item);
    }

    /// Non-blocking poll; `None` when empty.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Default for PacketQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
