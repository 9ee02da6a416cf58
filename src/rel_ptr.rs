// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Relative pointers: a (segment-id, byte-offset) pair that resolves to a
// process-local address through a per-process table of mapped segments.
// Every pointer stored inside shared memory is a RelPtr; absolute addresses
// never cross a process boundary because each process maps the same segment
// at a different base.
//
// Registration takes the table's write lock; resolution is a wait-free
// indexed read of an atomic slot.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::fatal;
use crate::spin_lock::SpinLock;

/// Distinguished id encoding the null relative pointer.
pub const SEGMENT_ID_NULL: u64 = 0;

/// Size of the per-process segment table. Segment ids are 1-based table
/// indices, so valid ids are `1..MAX_SEGMENTS`.
pub const MAX_SEGMENTS: usize = 64;

// ---------------------------------------------------------------------------
// Per-process segment table
// ---------------------------------------------------------------------------

struct Slot {
    base: AtomicUsize, // 0 = unregistered
    size: AtomicUsize,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: Slot = Slot {
    base: AtomicUsize::new(0),
    size: AtomicUsize::new(0),
};

static SLOTS: [Slot; MAX_SEGMENTS] = [EMPTY_SLOT; MAX_SEGMENTS];
static WRITE_LOCK: SpinLock = SpinLock::new();

/// RAII registration of a mapped segment. Dropping the token removes the
/// segment from the table.
#[derive(Debug)]
pub struct SegmentToken {
    id: u64,
}

impl SegmentToken {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SegmentToken {
    fn drop(&mut self) {
        WRITE_LOCK.with(|| {
            let slot = &SLOTS[self.id as usize];
            slot.size.store(0, Ordering::Relaxed);
            slot.base.store(0, Ordering::Release);
        });
    }
}

/// Errors from segment registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("segment id {0} out of range")]
    IdOutOfRange(u64),
    #[error("segment id {0} already registered in this process")]
    AlreadyRegistered(u64),
}

/// Register a mapped segment under `id`.
///
/// `base` is the address the segment is mapped at in *this* process; other
/// processes register the same id with their own base.
pub fn register_segment(
    id: u64,
    base: *mut u8,
    size: usize,
) -> Result<SegmentToken, RegisterError> {
    if id == SEGMENT_ID_NULL || id as usize >= MAX_SEGMENTS {
        return Err(RegisterError::IdOutOfRange(id));
    }
    WRITE_LOCK.with(|| {
        let slot = &SLOTS[id as usize];
        if slot.base.load(Ordering::Relaxed) != 0 {
            return Err(RegisterError::AlreadyRegistered(id));
        }
        slot.size.store(size, Ordering::Relaxed);
        slot.base.store(base as usize, Ordering::Release);
        Ok(SegmentToken { id })
    })
}

/// Whether `id` is currently registered in this process.
pub fn is_registered(id: u64) -> bool {
    if id == SEGMENT_ID_NULL || id as usize >= MAX_SEGMENTS {
        return false;
    }
    SLOTS[id as usize].base.load(Ordering::Acquire) != 0
}

/// Base address of a registered segment, or `None`.
pub fn segment_base(id: u64) -> Option<*mut u8> {
    if id == SEGMENT_ID_NULL || id as usize >= MAX_SEGMENTS {
        return None;
    }
    let base = SLOTS[id as usize].base.load(Ordering::Acquire);
    if base == 0 {
        None
    } else {
        Some(base as *mut u8)
    }
}

/// Find the registered segment containing `addr`. Returns `(id, offset)`.
pub fn find_segment(addr: *const u8) -> Option<(u64, u64)> {
    let a = addr as usize;
    for (id, slot) in SLOTS.iter().enumerate().skip(1) {
        let base = slot.base.load(Ordering::Acquire);
        if base == 0 {
            continue;
        }
        let size = slot.size.load(Ordering::Relaxed);
        if a >= base && a < base + size {
            return Some((id as u64, (a - base) as u64));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// RelPtr<T>
// ---------------------------------------------------------------------------

/// A pointer stored as (segment-id, offset), valid across process
/// boundaries. 16 bytes, `#[repr(C)]`, freely embeddable in shared records.
#[repr(C)]
pub struct RelPtr<T> {
    segment_id: u64,
    offset: u64,
    _marker: PhantomData<*mut T>,
}

impl<T> Clone for RelPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for RelPtr<T> {}

// Safety: a RelPtr is a pair of integers; dereferencing is what needs care.
unsafe impl<T> Send for RelPtr<T> {}
unsafe impl<T> Sync for RelPtr<T> {}

impl<T> RelPtr<T> {
    /// The null relative pointer.
    pub const fn null() -> Self {
        Self {
            segment_id: SEGMENT_ID_NULL,
            offset: 0,
            _marker: PhantomData,
        }
    }

    /// Construct from an explicit segment id and byte offset.
    pub const fn from_parts(segment_id: u64, offset: u64) -> Self {
        Self {
            segment_id,
            offset,
            _marker: PhantomData,
        }
    }

    /// Construct from a process-local address inside a registered segment.
    ///
    /// A pointer outside every registered segment is a programmer error and
    /// aborts the process.
    pub fn from_addr(p: *const T) -> Self {
        if p.is_null() {
            return Self::null();
        }
        match find_segment(p as *const u8) {
            Some((segment_id, offset)) => Self {
                segment_id,
                offset,
                _marker: PhantomData,
            },
            None => fatal("address does not belong to any registered segment"),
        }
    }

    pub fn is_null(&self) -> bool {
        self.segment_id == SEGMENT_ID_NULL
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Resolve to a process-local pointer. Null resolves to the null
    /// pointer; an unregistered segment id is fatal.
    pub fn get(&self) -> *mut T {
        if self.is_null() {
            return std::ptr::null_mut();
        }
        match segment_base(self.segment_id) {
            Some(base) => unsafe { base.add(self.offset as usize) as *mut T },
            None => fatal("relative pointer into an unregistered segment"),
        }
    }

    /// Resolve and reborrow. The caller guarantees the pointee is live and
    /// that aliasing rules hold.
    ///
    /// # Safety
    /// Same contract as dereferencing the raw pointer from [`get`].
    pub unsafe fn as_ref(&self) -> Option<&T> {
        let p = self.get();
        if p.is_null() {
            None
        } else {
            Some(&*p)
        }
    }
}

impl<T> PartialEq for RelPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.segment_id == other.segment_id && self.offset == other.offset
    }
}
impl<T> Eq for RelPtr<T> {}

// Manual impl so `T: Debug` is not required.
impl<T> std::fmt::Debug for RelPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelPtr")
            .field("segment_id", &self.segment_id)
            .field("offset", &self.offset)
            .finish()
    }
}
