// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Bounded lock-free queues for shared memory.
//
// IndexQueue is an array queue with a per-slot sequence word: a slot is
// writable when its sequence equals the producer's cursor and readable when
// it equals cursor+1. Producers and consumers each advance their cursor by
// CAS, so the queue is MPMC-capable while staying FIFO per producer; a push
// that returns success is visible to later pops in a total order compatible
// with producer program order, and no element is lost or duplicated.
//
// ChunkQueue layers the delivery-queue semantics on top: a fixed physical
// capacity, a logical capacity from the subscriber's QoS, an overflow
// policy, and an overflow flag the consumer reads-and-clears.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::chunk::ChunkManagement;
use crate::rel_ptr::RelPtr;

// ---------------------------------------------------------------------------
// IndexQueue<T, N>
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct QueueSlot<T: Copy> {
    seq: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded MPMC array queue, `#[repr(C)]`, embeddable in shared records.
///
/// `N` is the physical slot count; the logical capacity is set at init time
/// and rounded up to a power of two ≤ `N`. Zeroed memory is the
/// "unconstructed" state; call [`init_in_place`] exactly once before use.
#[repr(C)]
pub struct IndexQueue<T: Copy, const N: usize> {
    mask: u64,
    _pad0: [u8; 64 - 8],
    tail: AtomicU64,
    _pad1: [u8; 64 - 8],
    head: AtomicU64,
    _pad2: [u8; 64 - 8],
    slots: [QueueSlot<T>; N],
}

unsafe impl<T: Copy + Send, const N: usize> Send for IndexQueue<T, N> {}
unsafe impl<T: Copy + Send, const N: usize> Sync for IndexQueue<T, N> {}

impl<T: Copy, const N: usize> IndexQueue<T, N> {
    /// Initialise with a logical capacity (rounded up to a power of two,
    /// clamped to `N`).
    ///
    /// # Safety
    /// `this` must point to writable (typically zeroed shared) memory; no
    /// other thread may touch the queue until this returns.
    pub unsafe fn init_in_place(this: *mut Self, capacity: usize) {
        debug_assert!(N.is_power_of_two());
        let cap = capacity.max(1).next_power_of_two().min(N);
        let q = &mut *this;
        q.mask = (cap - 1) as u64;
        q.tail = AtomicU64::new(0);
        q.head = AtomicU64::new(0);
        for (i, slot) in q.slots.iter_mut().take(cap).enumerate() {
            slot.seq = AtomicU64::new(i as u64);
        }
    }

    /// Logical capacity.
    pub fn capacity(&self) -> usize {
        (self.mask + 1) as usize
    }

    /// Number of queued elements. Observational; may race.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.saturating_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push `value`; returns it back when the queue is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let mask = self.mask;
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos & mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as i64 - pos as i64;
            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        // Publish: the consumer's Acquire load of seq sees
                        // the value write.
                        slot.seq.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Pop the oldest element, or `None` when empty. Wait-free in the
    /// absence of producer stalls.
    pub fn try_pop(&self) -> Option<T> {
        let mask = self.mask;
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos & mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as i64 - (pos + 1) as i64;
            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init() };
                        slot.seq.store(pos + mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ChunkQueue — the per-subscriber delivery queue
// ---------------------------------------------------------------------------

/// Physical slot count of every delivery queue; the logical capacity from
/// the subscriber's QoS is at most this.
pub const MAX_QUEUE_CAPACITY: usize = 256;

/// What a full delivery queue does with a new chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverflowPolicy {
    /// Evict the oldest queued chunk to make room. Pushes never fail.
    DiscardOldest = 0,
    /// Refuse the new chunk; the producer rolls its refcount back.
    RejectNew = 1,
}

impl OverflowPolicy {
    pub fn from_byte(b: u8) -> Self {
        if b == 1 {
            OverflowPolicy::RejectNew
        } else {
            OverflowPolicy::DiscardOldest
        }
    }
}

/// Outcome of a delivery-queue push.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// Pushed after evicting the oldest element; the caller owns the
    /// evicted reference and must release it.
    Evicted(RelPtr<ChunkManagement>),
    /// Rejected (policy `RejectNew`); the caller rolls back its increment.
    Full,
}

/// Bounded queue of chunk references with overflow bookkeeping.
#[repr(C)]
pub struct ChunkQueue {
    queue: IndexQueue<RelPtr<ChunkManagement>, MAX_QUEUE_CAPACITY>,
    policy: AtomicU8,
    overflowed: AtomicBool,
}

impl ChunkQueue {
    /// # Safety
    /// Same contract as [`IndexQueue::init_in_place`].
    pub unsafe fn init_in_place(this: *mut Self, capacity: usize, policy: OverflowPolicy) {
        IndexQueue::init_in_place(std::ptr::addr_of_mut!((*this).queue), capacity);
        (*this).policy = AtomicU8::new(policy as u8);
        (*this).overflowed = AtomicBool::new(false);
    }

    pub fn policy(&self) -> OverflowPolicy {
        OverflowPolicy::from_byte(self.policy.load(Ordering::Relaxed))
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Push a chunk reference whose refcount the caller has already
    /// incremented. The increment-before-push order is what lets a consumer
    /// assume every popped reference is counted.
    pub fn try_push(&self, value: RelPtr<ChunkManagement>) -> PushOutcome {
        match self.queue.try_push(value) {
            Ok(()) => PushOutcome::Pushed,
            Err(rejected) => match self.policy() {
                OverflowPolicy::RejectNew => PushOutcome::Full,
                OverflowPolicy::DiscardOldest => {
                    // Evict until the push lands. Concurrent producers can
                    // displace more than one element; surplus evictions are
                    // released here so exactly one reaches the caller.
                    let mut evicted: Option<RelPtr<ChunkManagement>> = None;
                    loop {
                        if let Some(old) = self.queue.try_pop() {
                            if let Some(extra) = evicted.replace(old) {
                                ChunkManagement::release(extra);
                            }
                            self.overflowed.store(true, Ordering::Relaxed);
                        }
                        match self.queue.try_push(rejected) {
                            Ok(()) => {
                                return match evicted {
                                    Some(old) => PushOutcome::Evicted(old),
                                    None => PushOutcome::Pushed,
                                };
                            }
                            Err(_) => continue,
                        }
                    }
                }
            },
        }
    }

    /// Pop the oldest chunk reference. The popped reference carries one
    /// refcount the consumer now owns.
    pub fn try_pop(&self) -> Option<RelPtr<ChunkManagement>> {
        self.queue.try_pop()
    }

    /// Read and clear the overflow flag.
    pub fn take_overflow_flag(&self) -> bool {
        self.overflowed.swap(false, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(64))]
    struct Aligned<T>(T);

    fn boxed_queue(capacity: usize) -> Box<Aligned<IndexQueue<u64, 16>>> {
        unsafe {
            let mut b: Box<Aligned<IndexQueue<u64, 16>>> =
                Box::new(std::mem::zeroed());
            IndexQueue::init_in_place(&mut b.0, capacity);
            b
        }
    }

    #[test]
    fn fifo_order() {
        let q = boxed_queue(8);
        for v in 0..5u64 {
            q.0.try_push(v).unwrap();
        }
        for v in 0..5u64 {
            assert_eq!(q.0.try_pop(), Some(v));
        }
        assert_eq!(q.0.try_pop(), None);
    }

    #[test]
    fn full_returns_value() {
        let q = boxed_queue(2);
        q.0.try_push(1).unwrap();
        q.0.try_push(2).unwrap();
        assert_eq!(q.0.try_push(3), Err(3));
        assert_eq!(q.0.try_pop(), Some(1));
        q.0.try_push(3).unwrap();
        assert_eq!(q.0.try_pop(), Some(2));
        assert_eq!(q.0.try_pop(), Some(3));
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let q = boxed_queue(3);
        assert_eq!(q.0.capacity(), 4);
        let q = boxed_queue(200);
        assert_eq!(q.0.capacity(), 16); // clamped to N
    }

    #[test]
    fn wraparound_many_times() {
        let q = boxed_queue(4);
        for round in 0..100u64 {
            q.0.try_push(round).unwrap();
            assert_eq!(q.0.try_pop(), Some(round));
        }
        assert!(q.0.is_empty());
    }

    #[test]
    fn concurrent_push_pop_no_loss() {
        use std::sync::atomic::{AtomicU64 as Sum, Ordering};
        use std::sync::Arc;

        let q = Arc::new(boxed_queue(16));
        let popped_sum = Arc::new(Sum::new(0));
        let popped_count = Arc::new(Sum::new(0));

        const PER_PRODUCER: u64 = 5000;
        let producers: Vec<_> = (0..2)
            .map(|p| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let v = p * PER_PRODUCER + i + 1;
                        loop {
                            if q.0.try_push(v).is_ok() {
                                break;
                            }
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let q = Arc::clone(&q);
                let sum = Arc::clone(&popped_sum);
                let count = Arc::clone(&popped_count);
                std::thread::spawn(move || loop {
                    match q.0.try_pop() {
                        Some(v) => {
                            sum.fetch_add(v, Ordering::Relaxed);
                            count.fetch_add(1, Ordering::Relaxed);
                        }
                        None => {
                            if count.load(Ordering::Relaxed) == 2 * PER_PRODUCER {
                                break;
                            }
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        for t in producers {
            t.join().unwrap();
        }
        for t in consumers {
            t.join().unwrap();
        }

        let n = 2 * PER_PRODUCER;
        assert_eq!(popped_count.load(Ordering::Relaxed), n);
        assert_eq!(popped_sum.load(Ordering::Relaxed), n * (n + 1) / 2);
    }

    fn boxed_chunk_queue(capacity: usize, policy: OverflowPolicy) -> Box<Aligned<ChunkQueue>> {
        unsafe {
            let mut b: Box<Aligned<ChunkQueue>> = Box::new(std::mem::zeroed());
            ChunkQueue::init_in_place(&mut b.0, capacity, policy);
            b
        }
    }

    fn fake_ref(k: u64) -> RelPtr<ChunkManagement> {
        RelPtr::from_parts(60, k * 64)
    }

    #[test]
    fn discard_oldest_evicts_and_flags() {
        let q = boxed_chunk_queue(2, OverflowPolicy::DiscardOldest);
        assert_eq!(q.0.try_push(fake_ref(1)), PushOutcome::Pushed);
        assert_eq!(q.0.try_push(fake_ref(2)), PushOutcome::Pushed);
        assert!(!q.0.take_overflow_flag());

        match q.0.try_push(fake_ref(3)) {
            PushOutcome::Evicted(old) => assert_eq!(old, fake_ref(1)),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert!(q.0.take_overflow_flag());
        assert!(!q.0.take_overflow_flag()); // cleared after read

        assert_eq!(q.0.try_pop(), Some(fake_ref(2)));
        assert_eq!(q.0.try_pop(), Some(fake_ref(3)));
        assert_eq!(q.0.try_pop(), None);
    }

    #[test]
    fn reject_new_reports_full() {
        let q = boxed_chunk_queue(2, OverflowPolicy::RejectNew);
        assert_eq!(q.0.try_push(fake_ref(1)), PushOutcome::Pushed);
        assert_eq!(q.0.try_push(fake_ref(2)), PushOutcome::Pushed);
        assert_eq!(q.0.try_push(fake_ref(3)), PushOutcome::Full);
        assert!(!q.0.take_overflow_flag());

        assert_eq!(q.0.try_pop(), Some(fake_ref(1)));
        assert_eq!(q.0.try_pop(), Some(fake_ref(2)));
        assert_eq!(q.0.try_pop(), None);
    }
}
