//! Bounded blocking ring of fixed-size byte blocks.
//!
//! A single-producer/single-consumer queue for streaming file data to a
//! device. All block storage is allocated once at construction and recycled
//! for the lifetime of the ring; the hot path never allocates.
//!
//! # Overview
//!
//! - [`Producer`] - Write end: reserve a slot, fill it, commit it.
//! - [`Consumer`] - Read end: pop committed blocks in FIFO order.
//! - One mutex guards the head/tail/count bookkeeping; two condition
//!   variables (`not_full`, `not_empty`) park whichever side has no work.
//!   The lock is held only for bookkeeping, never while a block's payload
//!   is being filled or drained.
//!
//! A full ring blocks the producer (backpressure); an empty ring blocks the
//! consumer. The `last` flag on a block marks end-of-stream: once the
//! consumer has seen it, no further blocks will ever arrive.
//!
//! # Ownership protocol
//!
//! Each endpoint owns one private block in addition to the ring's
//! `capacity` slots. [`Producer::acquire`] hands the producer its staging
//! block for exclusive use; [`WriteSlot::commit`] swaps it into the slot at
//! `tail`. [`Consumer::pop`] swaps the slot at `head` with the consumer's
//! scratch block and returns a borrow that lives until the next `pop`. No
//! two threads can ever touch the same payload bytes, which is why nothing
//! here needs `unsafe`.
//!
//! # Example
//!
//! ```
//! use tspump::ring;
//!
//! let (mut producer, mut consumer) = ring::block_ring(4, 16).unwrap();
//!
//! let mut slot = producer.acquire().unwrap();
//! slot.buf()[..5].copy_from_slice(b"hello");
//! slot.commit(5, true);
//!
//! let block = consumer.pop().unwrap();
//! assert_eq!(block.payload(), b"hello");
//! assert!(block.is_last());
//! ```

use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use thiserror::Error;

/// Error constructing a ring.
#[derive(Debug, Error)]
pub enum RingError {
    /// Ring capacity of zero can never make progress.
    #[error("ring capacity must be nonzero")]
    ZeroCapacity,
    /// Blocks must be able to hold at least one byte.
    #[error("block size must be nonzero")]
    ZeroBlockSize,
    /// Block storage could not be allocated.
    #[error("failed to allocate {bytes} bytes of block storage")]
    Alloc { bytes: usize },
}

/// The consumer endpoint is gone; committed blocks will never be drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("consumer endpoint disconnected")]
pub struct Disconnected;

/// A fixed-capacity byte buffer plus transfer metadata.
///
/// `len` is the number of valid payload bytes (at most the block's
/// capacity). `last` marks the final block of the stream; a last block may
/// carry zero payload bytes when the source ended exactly on a block
/// boundary.
#[derive(Debug)]
pub struct Block {
    data: Box<[u8]>,
    len: usize,
    last: bool,
}

impl Block {
    fn with_capacity(block_size: usize) -> Result<Self, RingError> {
        let mut data = Vec::new();
        data.try_reserve_exact(block_size)
            .map_err(|_| RingError::Alloc { bytes: block_size })?;
        data.resize(block_size, 0);
        Ok(Self {
            data: data.into_boxed_slice(),
            len: 0,
            last: false,
        })
    }

    /// The valid payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Number of valid payload bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the block carries no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True for the final block of the stream.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.last
    }

    /// Storage capacity in bytes, fixed at ring construction.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// Ring bookkeeping, guarded by [`Shared::state`].
struct RingState {
    /// Exactly `capacity` blocks, allocated once.
    slots: Box<[Block]>,
    /// Next slot to pop.
    head: usize,
    /// Next slot to fill.
    tail: usize,
    /// Committed, unconsumed slots. Invariant: `0 <= count <= capacity`.
    count: usize,
    producer_gone: bool,
    consumer_gone: bool,
}

struct Shared {
    state: Mutex<RingState>,
    /// Signalled by `pop` when a slot frees up.
    not_full: Condvar,
    /// Signalled by `commit` when a block arrives.
    not_empty: Condvar,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().expect("ring state lock poisoned")
    }
}

/// Advances a slot index, wrapping to 0 at capacity.
const fn next_index(index: usize, capacity: usize) -> usize {
    let next = index + 1;
    if next == capacity { 0 } else { next }
}

/// Write end of the ring.
///
/// Methods take `&mut self`, so holding the `Producer` is holding the
/// single-producer role; there is no way to commit from two threads.
pub struct Producer {
    shared: Arc<Shared>,
    /// Producer-owned block, swapped into the ring on commit.
    staging: Block,
}

/// Read end of the ring. Same single-owner discipline as [`Producer`].
pub struct Consumer {
    shared: Arc<Shared>,
    /// Consumer-owned block, swapped out of the ring on pop.
    scratch: Block,
}

/// A reserved write slot, valid until committed or dropped.
///
/// Committing consumes the slot, so each successful [`Producer::acquire`]
/// is committed at most once. Dropping the slot without committing abandons
/// the reservation; ring state is untouched.
pub struct WriteSlot<'a> {
    producer: &'a mut Producer,
}

impl WriteSlot<'_> {
    /// The full writable block buffer.
    pub fn buf(&mut self) -> &mut [u8] {
        &mut self.producer.staging.data
    }

    /// Buffer capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.producer.staging.capacity()
    }

    /// Publishes the slot with `len` valid bytes and the given end-of-stream
    /// flag, then wakes a consumer waiting on an empty ring.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the block capacity.
    pub fn commit(self, len: usize, last: bool) {
        let producer = self.producer;
        assert!(
            len <= producer.staging.capacity(),
            "commit length {len} exceeds block capacity {}",
            producer.staging.capacity()
        );
        producer.staging.len = len;
        producer.staging.last = last;

        let mut state = producer.shared.lock_state();
        // `acquire` saw a free slot and only `pop` has touched `count` since.
        debug_assert!(state.count < state.slots.len());
        let tail = state.tail;
        mem::swap(&mut state.slots[tail], &mut producer.staging);
        state.tail = next_index(tail, state.slots.len());
        state.count += 1;
        drop(state);
        producer.shared.not_empty.notify_one();
    }
}

impl Producer {
    /// Reserves the next write slot, waiting while the ring is full.
    ///
    /// The wait is a condition-variable park, not a spin. On success the
    /// returned slot is the producer's exclusive staging buffer until
    /// [`WriteSlot::commit`].
    ///
    /// # Errors
    ///
    /// Returns [`Disconnected`] if the consumer endpoint has been dropped;
    /// committing further blocks would only fill a ring nobody drains.
    pub fn acquire(&mut self) -> Result<WriteSlot<'_>, Disconnected> {
        {
            let state = self.shared.lock_state();
            let state = self
                .shared
                .not_full
                .wait_while(state, |st| {
                    !st.consumer_gone && st.count == st.slots.len()
                })
                .expect("ring state lock poisoned");
            if state.consumer_gone {
                return Err(Disconnected);
            }
        }
        Ok(WriteSlot { producer: self })
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        state.producer_gone = true;
        drop(state);
        // A consumer parked on an empty ring must not wait forever for a
        // block that can no longer arrive.
        self.shared.not_empty.notify_all();
    }
}

impl Consumer {
    /// Pops the oldest committed block, waiting while the ring is empty.
    ///
    /// The returned borrow is valid until the next `pop` call; the block's
    /// storage silently re-enters the ring on that call. Wakes a producer
    /// waiting on a full ring.
    ///
    /// Returns `None` once the producer endpoint is gone and the ring has
    /// drained. A well-behaved producer ends the stream with a `last` block
    /// instead, so `None` signals an abnormally terminated stream.
    pub fn pop(&mut self) -> Option<&Block> {
        let state = self.shared.lock_state();
        let mut state = self
            .shared
            .not_empty
            .wait_while(state, |st| st.count == 0 && !st.producer_gone)
            .expect("ring state lock poisoned");
        if state.count == 0 {
            return None;
        }
        let head = state.head;
        mem::swap(&mut state.slots[head], &mut self.scratch);
        state.head = next_index(head, state.slots.len());
        state.count -= 1;
        drop(state);
        self.shared.not_full.notify_one();
        Some(&self.scratch)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        state.consumer_gone = true;
        drop(state);
        // Unblock a producer parked on a full ring; its next acquire
        // reports Disconnected.
        self.shared.not_full.notify_all();
    }
}

/// Creates a ring of `capacity` blocks of `block_size` bytes each.
///
/// All storage (the slots plus one staging block per endpoint) is allocated
/// here; a failure part-way through unwinds every allocation made so far.
///
/// # Errors
///
/// Returns [`RingError::ZeroCapacity`] or [`RingError::ZeroBlockSize`] for
/// degenerate dimensions, and [`RingError::Alloc`] if block storage cannot
/// be obtained.
pub fn block_ring(capacity: usize, block_size: usize) -> Result<(Producer, Consumer), RingError> {
    if capacity == 0 {
        return Err(RingError::ZeroCapacity);
    }
    if block_size == 0 {
        return Err(RingError::ZeroBlockSize);
    }

    let mut slots = Vec::new();
    slots
        .try_reserve_exact(capacity)
        .map_err(|_| RingError::Alloc {
            bytes: capacity * mem::size_of::<Block>(),
        })?;
    for _ in 0..capacity {
        slots.push(Block::with_capacity(block_size)?);
    }

    let shared = Arc::new(Shared {
        state: Mutex::new(RingState {
            slots: slots.into_boxed_slice(),
            head: 0,
            tail: 0,
            count: 0,
            producer_gone: false,
            consumer_gone: false,
        }),
        not_full: Condvar::new(),
        not_empty: Condvar::new(),
    });

    let producer = Producer {
        shared: Arc::clone(&shared),
        staging: Block::with_capacity(block_size)?,
    };
    let consumer = Consumer {
        shared,
        scratch: Block::with_capacity(block_size)?,
    };
    Ok((producer, consumer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn basic_commit_pop() {
        let (mut producer, mut consumer) = block_ring(4, 16).unwrap();

        let mut slot = producer.acquire().unwrap();
        slot.buf()[..3].copy_from_slice(b"abc");
        slot.commit(3, false);

        let block = consumer.pop().unwrap();
        assert_eq!(block.payload(), b"abc");
        assert_eq!(block.len(), 3);
        assert!(!block.is_last());
    }

    #[test]
    fn fifo_order_across_wraparound() {
        let (mut producer, mut consumer) = block_ring(4, 4).unwrap();

        for round in 0..5u8 {
            for i in 0..4u8 {
                let value = round * 10 + i;
                let mut slot = producer.acquire().unwrap();
                slot.buf()[0] = value;
                slot.commit(1, false);
            }
            for i in 0..4u8 {
                let expected = round * 10 + i;
                assert_eq!(consumer.pop().unwrap().payload(), &[expected]);
            }
        }
    }

    #[test]
    fn payload_respects_committed_length() {
        let (mut producer, mut consumer) = block_ring(1, 8).unwrap();

        let mut slot = producer.acquire().unwrap();
        slot.buf().copy_from_slice(b"xxxxxxxx");
        slot.commit(8, false);
        assert_eq!(consumer.pop().unwrap().payload(), b"xxxxxxxx");

        let mut slot = producer.acquire().unwrap();
        slot.buf()[..2].copy_from_slice(b"ok");
        slot.commit(2, false);
        // A shorter commit must not leak bytes from the slot's previous use.
        assert_eq!(consumer.pop().unwrap().payload(), b"ok");
    }

    #[test]
    fn backpressure_blocks_producer_until_pop() {
        let (mut producer, mut consumer) = block_ring(1, 8).unwrap();

        let mut slot = producer.acquire().unwrap();
        slot.buf()[0] = 1;
        slot.commit(1, false);

        let committed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&committed);
        let handle = thread::spawn(move || {
            let mut slot = producer.acquire().unwrap();
            slot.buf()[0] = 2;
            slot.commit(1, false);
            flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(
            !committed.load(Ordering::SeqCst),
            "producer should be parked on a full ring"
        );

        assert_eq!(consumer.pop().unwrap().payload(), &[1]);
        handle.join().unwrap();
        assert!(committed.load(Ordering::SeqCst));
        assert_eq!(consumer.pop().unwrap().payload(), &[2]);
    }

    #[test]
    fn commit_wakes_blocked_consumer() {
        let (mut producer, mut consumer) = block_ring(2, 8).unwrap();

        let handle = thread::spawn(move || {
            let block = consumer.pop().expect("a block must arrive");
            (block.payload().to_vec(), block.is_last())
        });

        // Give the consumer time to park on the empty ring first.
        thread::sleep(Duration::from_millis(20));
        let mut slot = producer.acquire().unwrap();
        slot.buf()[..3].copy_from_slice(b"abc");
        slot.commit(3, true);

        let (payload, last) = handle.join().unwrap();
        assert_eq!(payload, b"abc");
        assert!(last);
    }

    #[test]
    fn concurrent_fifo_and_single_terminal() {
        let (mut producer, mut consumer) = block_ring(8, 8).unwrap();
        let count = 1000u32;

        let handle = thread::spawn(move || {
            for i in 0..count {
                let mut slot = producer.acquire().unwrap();
                slot.buf()[..4].copy_from_slice(&i.to_le_bytes());
                slot.commit(4, false);
            }
            let slot = producer.acquire().unwrap();
            slot.commit(0, true);
        });

        let mut seen = 0u32;
        loop {
            let block = consumer
                .pop()
                .expect("producer must finish with a last block");
            if block.is_last() {
                assert!(block.is_empty());
                break;
            }
            let mut raw = [0u8; 4];
            raw.copy_from_slice(block.payload());
            assert_eq!(u32::from_le_bytes(raw), seen);
            seen += 1;
        }
        assert_eq!(seen, count);
        // Nothing may follow the last block.
        assert!(consumer.pop().is_none());
        handle.join().unwrap();
    }

    #[test]
    fn consumer_sees_none_when_producer_vanishes() {
        let (producer, mut consumer) = block_ring(2, 8).unwrap();

        let handle = thread::spawn(move || consumer.pop().is_none());
        thread::sleep(Duration::from_millis(20));
        drop(producer);

        assert!(handle.join().unwrap());
    }

    #[test]
    fn acquire_fails_when_consumer_vanishes_mid_wait() {
        let (mut producer, consumer) = block_ring(1, 8).unwrap();

        let mut slot = producer.acquire().unwrap();
        slot.buf()[0] = 1;
        slot.commit(1, false);

        let handle = thread::spawn(move || producer.acquire().map(|_| ()).err());
        thread::sleep(Duration::from_millis(20));
        drop(consumer);

        assert_eq!(handle.join().unwrap(), Some(Disconnected));
    }

    #[test]
    fn acquire_fails_immediately_after_consumer_drop() {
        let (mut producer, consumer) = block_ring(4, 8).unwrap();
        drop(consumer);
        assert!(producer.acquire().is_err());
    }

    #[test]
    fn dropping_an_uncommitted_slot_leaves_the_ring_unchanged() {
        let (mut producer, mut consumer) = block_ring(1, 8).unwrap();

        {
            let _slot = producer.acquire().unwrap();
            // Dropped without commit: the reservation simply evaporates.
        }

        let mut slot = producer.acquire().unwrap();
        slot.buf()[..2].copy_from_slice(b"ok");
        slot.commit(2, true);
        assert_eq!(consumer.pop().unwrap().payload(), b"ok");
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(block_ring(0, 8), Err(RingError::ZeroCapacity)));
    }

    #[test]
    fn rejects_zero_block_size() {
        assert!(matches!(block_ring(8, 0), Err(RingError::ZeroBlockSize)));
    }
}
