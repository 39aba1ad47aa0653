//! Reusable packet buffers
//!
//! Buffers are fixed-size byte regions with NIO-style cursors
//! (`position`/`limit`). The pool hands them out and takes them back so the
//! data plane does not allocate per packet.
//!
//! Ownership is explicit: whoever holds a [`Buffer`] owns it, and the last
//! holder returns it with [`BufferPool::release`]. Every buffer carries a
//! process-unique [`BufferId`] and a generation that the pool bumps on each
//! acquire. The pool refuses ids that are already free and copies whose
//! generation is older than the current lease.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::config::DEFAULT_BUFFER_SIZE;

/// Source of buffer ids, shared by all pools so ids never collide.
static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a pooled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buf({})", self.0)
    }
}

/// A fixed-capacity byte buffer with read/write cursors.
///
/// In write mode `position..limit` is the free space; after [`flip`](Self::flip)
/// it is the readable data. Not `Clone`: a buffer has exactly one owner.
pub struct Buffer {
    id: BufferId,
    generation: u64,
    data: Box<[u8]>,
    position: usize,
    limit: usize,
}

impl Buffer {
    fn allocate(capacity: usize) -> Self {
        Buffer {
            id: BufferId::next(),
            generation: 0,
            data: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            limit: capacity,
        }
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Lease counter, bumped every time the pool hands the buffer out.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bitwise copy sharing id and generation, for double-release tests.
    #[cfg(test)]
    pub(crate) fn duplicate(&self) -> Buffer {
        Buffer {
            id: self.id,
            generation: self.generation,
            data: self.data.clone(),
            position: self.position,
            limit: self.limit,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Reset to write mode covering the whole buffer.
    #[inline]
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.data.len();
    }

    /// Switch from writing to reading the bytes written so far.
    #[inline]
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// Move the position forward after reading or writing `n` bytes.
    ///
    /// # Panics
    /// Panics if `n` exceeds [`remaining`](Self::remaining).
    #[inline]
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.remaining(), "advance past buffer limit");
        self.position += n;
    }

    /// Bytes between position and limit.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Mutable view of the bytes between position and limit.
    ///
    /// Use this as the destination of a read, then [`advance`](Self::advance).
    #[inline]
    pub fn write_area(&mut self) -> &mut [u8] {
        &mut self.data[self.position..self.limit]
    }

    /// Copy as much of `src` as fits and advance. Returns the bytes copied.
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.position..self.position + n].copy_from_slice(&src[..n]);
        self.position += n;
        n
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("capacity", &self.data.len())
            .field("position", &self.position)
            .field("limit", &self.limit)
            .finish()
    }
}

/// Outcome of [`BufferPool::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    /// Buffer was returned to the free set
    Released,
    /// Nothing to release
    Null,
    /// Buffer is already free; the call had no effect
    AlreadyReleased,
}

struct FreeList {
    buffers: VecDeque<Buffer>,
    ids: HashSet<BufferId>,
    /// Generation of every buffer currently lent out by this pool
    lent: HashMap<BufferId, u64>,
}

/// Pool of reusable fixed-size buffers.
///
/// Never fails to hand out a buffer: when the free set is empty a new one is
/// allocated. Safe to share between threads behind an `Arc`.
pub struct BufferPool {
    buffer_size: usize,
    /// Free buffers and their ids, guarded together so membership checks
    /// cannot race with acquire.
    free: Mutex<FreeList>,
    /// Incremented on fresh allocation, decremented on release, floored at zero
    allocations: AtomicU64,
}

impl BufferPool {
    /// Create a pool of 16 KiB buffers.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        BufferPool {
            buffer_size,
            free: Mutex::new(FreeList {
                buffers: VecDeque::new(),
                ids: HashSet::new(),
                lent: HashMap::new(),
            }),
            allocations: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn free_list(&self) -> MutexGuard<'_, FreeList> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a buffer from the pool, allocating one if none is free.
    ///
    /// The returned buffer is cleared and ready for writing.
    pub fn acquire(&self) -> Buffer {
        // Pop and start the new lease under one lock so a stale copy cannot
        // slip in between.
        let reused = {
            let mut free = self.free_list();
            let mut buffer = free.buffers.pop_front();
            if let Some(ref mut b) = buffer {
                free.ids.remove(&b.id);
                b.generation += 1;
                free.lent.insert(b.id, b.generation);
            }
            buffer
        };

        let mut buffer = match reused {
            Some(buffer) => buffer,
            None => {
                self.allocations.fetch_add(1, Ordering::AcqRel);
                let mut buffer = Buffer::allocate(self.buffer_size);
                buffer.generation = 1;
                self.free_list().lent.insert(buffer.id, buffer.generation);
                buffer
            }
        };
        buffer.clear();
        buffer
    }

    /// Return a buffer to the pool.
    ///
    /// `None`, buffers that are already free and copies from an earlier lease
    /// are ignored and reported through the returned status.
    pub fn release(&self, buffer: Option<Buffer>) -> ReleaseStatus {
        let Some(mut buffer) = buffer else {
            debug!("Trying to release a null buffer, skipping");
            return ReleaseStatus::Null;
        };

        {
            let mut free = self.free_list();
            if free.ids.contains(&buffer.id) {
                debug!(id = %buffer.id, "Buffer is already in the pool, skipping");
                return ReleaseStatus::AlreadyReleased;
            }
            if let Some(&current) = free.lent.get(&buffer.id)
                && current != buffer.generation
            {
                debug!(
                    id = %buffer.id,
                    generation = buffer.generation,
                    current,
                    "Buffer is from an earlier lease, skipping"
                );
                return ReleaseStatus::AlreadyReleased;
            }
            free.lent.remove(&buffer.id);
            free.ids.insert(buffer.id);
            buffer.clear();
            free.buffers.push_back(buffer);
        }

        // fetch_update only fails when the closure returns None
        let _ = self
            .allocations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(1))
            });
        ReleaseStatus::Released
    }

    /// Live allocation counter.
    ///
    /// Grows only when `acquire` has to allocate; every successful release
    /// decrements it, never below zero.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Acquire)
    }

    /// Number of free buffers.
    pub fn available(&self) -> usize {
        self.free_list().buffers.len()
    }

    /// Drop every free buffer.
    pub fn clear(&self) {
        let mut free = self.free_list();
        free.buffers.clear();
        free.ids.clear();
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_allocates_when_empty() {
        let pool = BufferPool::new();
        let buf = pool.acquire();
        assert_eq!(buf.capacity(), DEFAULT_BUFFER_SIZE);
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), DEFAULT_BUFFER_SIZE);
        assert_eq!(pool.allocations(), 1);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_release_then_reuse() {
        let pool = BufferPool::with_buffer_size(64);
        let mut buf = pool.acquire();
        let id = buf.id();
        buf.put_slice(b"hello");

        assert_eq!(pool.release(Some(buf)), ReleaseStatus::Released);
        assert_eq!(pool.allocations(), 0);
        assert_eq!(pool.available(), 1);

        let buf = pool.acquire();
        assert_eq!(buf.id(), id);
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 64);
        // Reuse does not count as a new allocation
        assert_eq!(pool.allocations(), 0);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_release_null() {
        let pool = BufferPool::with_buffer_size(64);
        let _held = pool.acquire();
        assert_eq!(pool.release(None), ReleaseStatus::Null);
        assert_eq!(pool.allocations(), 1);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_double_release_is_ignored() {
        let pool = BufferPool::with_buffer_size(64);
        let _other = pool.acquire();
        let buf = pool.acquire();
        let twin = buf.duplicate();
        assert_eq!(pool.allocations(), 2);

        assert_eq!(pool.release(Some(buf)), ReleaseStatus::Released);
        assert_eq!(pool.allocations(), 1);
        assert_eq!(pool.available(), 1);

        assert_eq!(pool.release(Some(twin)), ReleaseStatus::AlreadyReleased);
        assert_eq!(pool.allocations(), 1);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_stale_copy_cannot_steal_new_lease() {
        let pool = BufferPool::with_buffer_size(64);
        let held = pool.acquire();
        let stale = held.duplicate();

        assert_eq!(pool.release(Some(held)), ReleaseStatus::Released);
        let owner = pool.acquire();
        assert_eq!(owner.id(), stale.id());
        assert!(owner.generation() > stale.generation());

        assert_eq!(pool.release(Some(stale)), ReleaseStatus::AlreadyReleased);
        assert_eq!(pool.available(), 0);

        // The current owner is still the only holder of that id
        let second = pool.acquire();
        assert_ne!(second.id(), owner.id());
        assert_eq!(pool.release(Some(owner)), ReleaseStatus::Released);
        assert_eq!(pool.release(Some(second)), ReleaseStatus::Released);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_generation_advances_per_lease() {
        let pool = BufferPool::with_buffer_size(64);
        let buf = pool.acquire();
        let first = buf.generation();
        pool.release(Some(buf));
        let buf = pool.acquire();
        assert_eq!(buf.generation(), first + 1);
    }

    #[test]
    fn test_allocation_count_floor() {
        let pool = BufferPool::with_buffer_size(64);
        let foreign = BufferPool::with_buffer_size(64);
        for _ in 0..5 {
            assert_eq!(pool.release(Some(foreign.acquire())), ReleaseStatus::Released);
        }
        assert_eq!(pool.allocations(), 0);
        assert_eq!(pool.available(), 5);
    }

    #[test]
    fn test_clear_drops_free_buffers() {
        let pool = BufferPool::with_buffer_size(64);
        let buf = pool.acquire();
        let id = buf.id();
        pool.release(Some(buf));
        pool.clear();
        assert_eq!(pool.available(), 0);

        let buf = pool.acquire();
        assert_ne!(buf.id(), id);
        assert_eq!(pool.allocations(), 1);
    }

    #[test]
    fn test_cursor_semantics() {
        let pool = BufferPool::with_buffer_size(16);
        let mut buf = pool.acquire();

        buf.write_area()[..4].copy_from_slice(&[1, 2, 3, 4]);
        buf.advance(4);
        assert_eq!(buf.remaining(), 12);

        buf.flip();
        assert_eq!(buf.data(), &[1, 2, 3, 4]);
        buf.advance(3);
        assert_eq!(buf.data(), &[4]);
        buf.advance(1);
        assert!(!buf.has_remaining());

        buf.clear();
        assert_eq!(buf.remaining(), 16);
        assert_eq!(buf.put_slice(&[0xaa; 20]), 16);
        assert!(!buf.has_remaining());
    }

    #[test]
    #[should_panic(expected = "advance past buffer limit")]
    fn test_advance_past_limit_panics() {
        let pool = BufferPool::with_buffer_size(8);
        let mut buf = pool.acquire();
        buf.advance(9);
    }

    #[test]
    fn test_concurrent_owners_are_exclusive() {
        let pool = Arc::new(BufferPool::with_buffer_size(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut a = pool.acquire();
                        let mut b = pool.acquire();
                        assert_ne!(a.id(), b.id());
                        let tag_a = a.id().raw().to_be_bytes();
                        let tag_b = b.id().raw().to_be_bytes();
                        a.put_slice(&tag_a);
                        b.put_slice(&tag_b);
                        a.flip();
                        b.flip();
                        // Nobody else wrote into our buffers while we held them
                        assert_eq!(a.data(), &tag_a[..]);
                        assert_eq!(b.data(), &tag_b[..]);
                        assert_eq!(pool.release(Some(a)), ReleaseStatus::Released);
                        assert_eq!(pool.release(Some(b)), ReleaseStatus::Released);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.allocations(), 0);
        assert!(pool.available() <= 16);
    }

    #[test]
    fn test_concurrent_double_release_admits_one() {
        for _ in 0..100 {
            let pool = Arc::new(BufferPool::with_buffer_size(64));
            let buf = pool.acquire();
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let pool = Arc::clone(&pool);
                    let copy = buf.duplicate();
                    thread::spawn(move || pool.release(Some(copy)))
                })
                .collect();
            let released = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|s| *s == ReleaseStatus::Released)
                .count();
            assert_eq!(released, 1);
            assert_eq!(pool.available(), 1);
            assert_eq!(pool.allocations(), 0);
        }
    }
}
