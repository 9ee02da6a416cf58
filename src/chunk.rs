// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Chunk metadata and reference counting.
//
// Every loaned block starts with a ChunkHeader; the user payload follows at
// `payload_offset`, aligned as requested. A 4-byte back-offset sits
// immediately before the payload so a payload pointer round-trips to its
// header without any table lookup.
//
// The management record lives in a dedicated small-block pool so headers
// stay payload-sized. Its refcount is the single ownership authority: the
// 1→0 transition is the unique release that returns the payload block to
// its origin pool and the management record to its own pool — in that
// order, because the record holds both pool back-pointers.

use std::sync::atomic::{fence, AtomicU64, Ordering};

use crate::error::fatal;
use crate::pool::{align_up, MemPool};
use crate::rel_ptr::RelPtr;

/// Metadata at the start of every loaned block.
#[repr(C)]
pub struct ChunkHeader {
    /// Total bytes of the backing block (the pool's block size).
    pub chunk_size: u32,
    /// Bytes of user payload.
    pub payload_size: u32,
    /// Alignment the payload was laid out for.
    pub payload_align: u32,
    /// Byte offset from the header base to the payload.
    pub payload_offset: u32,
    /// Unique id of the publishing port.
    pub origin_id: u64,
    /// Per-publisher send sequence number; written at send time.
    pub sequence: u64,
    /// Nanoseconds since the Unix epoch; written at send time.
    pub timestamp_ns: u64,
    /// Back-pointer to the management record.
    pub mgmt: RelPtr<ChunkManagement>,
}

/// Bytes reserved for the back-offset stored directly before the payload.
const BACK_OFFSET_BYTES: u64 = std::mem::size_of::<u32>() as u64;

impl ChunkHeader {
    /// Offset of the payload for a given alignment: past the header and the
    /// back-offset word, rounded up.
    pub fn payload_offset_for(payload_align: u32) -> u32 {
        let align = (payload_align as u64).max(BACK_OFFSET_BYTES);
        align_up(
            std::mem::size_of::<ChunkHeader>() as u64 + BACK_OFFSET_BYTES,
            align,
        ) as u32
    }

    /// Total block bytes needed for a payload of `payload_size` bytes at
    /// `payload_align`.
    pub fn required_chunk_size(payload_size: u64, payload_align: u32) -> u64 {
        Self::payload_offset_for(payload_align) as u64 + payload_size
    }

    /// Pointer to the payload of the chunk starting at `header`.
    pub fn payload_ptr(header: *mut ChunkHeader) -> *mut u8 {
        unsafe { (header as *mut u8).add((*header).payload_offset as usize) }
    }

    /// Recover the header from a payload pointer (round-trip of
    /// [`payload_ptr`]).
    pub fn from_payload(payload: *mut u8) -> *mut ChunkHeader {
        unsafe {
            let off = (payload.sub(BACK_OFFSET_BYTES as usize) as *const u32).read();
            payload.sub(off as usize) as *mut ChunkHeader
        }
    }

    /// Write a fresh header into `block` and stamp the back-offset word.
    ///
    /// # Safety
    /// `block` must point to at least `chunk_size` writable bytes.
    pub unsafe fn write_new(
        block: *mut u8,
        chunk_size: u32,
        payload_size: u32,
        payload_align: u32,
        mgmt: RelPtr<ChunkManagement>,
    ) -> *mut ChunkHeader {
        let payload_offset = Self::payload_offset_for(payload_align);
        let header = block as *mut ChunkHeader;
        std::ptr::write(
            header,
            ChunkHeader {
                chunk_size,
                payload_size,
                payload_align,
                payload_offset,
                origin_id: 0,
                sequence: 0,
                timestamp_ns: 0,
                mgmt,
            },
        );
        let back = block.add(payload_offset as usize - BACK_OFFSET_BYTES as usize) as *mut u32;
        back.write(payload_offset);
        header
    }
}

/// The shared ownership record of one chunk.
#[repr(C)]
pub struct ChunkManagement {
    pub header: RelPtr<ChunkHeader>,
    pub origin_pool: RelPtr<MemPool>,
    pub mgmt_pool: RelPtr<MemPool>,
    ref_count: AtomicU64,
}

impl ChunkManagement {
    /// Construct a management record in place with an initial refcount of 1
    /// (held by the loaning side's handle).
    ///
    /// # Safety
    /// `this` must point to writable memory inside the management pool.
    pub unsafe fn init_in_place(
        this: *mut ChunkManagement,
        header: RelPtr<ChunkHeader>,
        origin_pool: RelPtr<MemPool>,
        mgmt_pool: RelPtr<MemPool>,
    ) {
        std::ptr::write(
            this,
            ChunkManagement {
                header,
                origin_pool,
                mgmt_pool,
                ref_count: AtomicU64::new(1),
            },
        );
    }

    /// Current reference count. Observational.
    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Take one additional reference.
    pub fn increment_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference. On the 1→0 transition, returns the payload block
    /// to its origin pool and the management record to the management pool.
    ///
    /// After this call the `mgmt` pointer may dangle; callers must not
    /// touch it again.
    pub fn release(mgmt: RelPtr<ChunkManagement>) {
        let record = unsafe { &*mgmt.get() };
        let prev = record.ref_count.fetch_sub(1, Ordering::Release);
        if prev == 0 {
            fatal("chunk refcount underflow");
        }
        if prev != 1 {
            return;
        }
        // Synchronise with every prior release before tearing down.
        fence(Ordering::Acquire);

        let header_ptr = record.header.get() as *mut u8;
        let origin_pool = unsafe { &*record.origin_pool.get() };
        let mgmt_pool_ptr = record.mgmt_pool;

        origin_pool.free_chunk(header_ptr);
        // The management record goes last; it held the pool back-pointers.
        let mgmt_pool = unsafe { &*mgmt_pool_ptr.get() };
        mgmt_pool.free_chunk(mgmt.get() as *mut u8);
    }
}

// ---------------------------------------------------------------------------
// Chunk — the process-local smart handle
// ---------------------------------------------------------------------------

/// An owned reference to one chunk. Dropping releases the reference; the
/// last release returns the block to its pool.
pub struct Chunk {
    mgmt: RelPtr<ChunkManagement>,
}

// Safety: ownership is tracked by the shared refcount; the handle itself is
// a plain relative pointer.
unsafe impl Send for Chunk {}

impl Chunk {
    /// Adopt one already-counted reference.
    ///
    /// # Safety
    /// `mgmt` must point to a live management record and the caller must own
    /// exactly one uncredited reference to it.
    pub unsafe fn from_rel(mgmt: RelPtr<ChunkManagement>) -> Self {
        Self { mgmt }
    }

    /// Hand the reference over to the caller without releasing it.
    pub fn into_rel(self) -> RelPtr<ChunkManagement> {
        let m = self.mgmt;
        std::mem::forget(self);
        m
    }

    pub(crate) fn mgmt(&self) -> &ChunkManagement {
        unsafe { &*self.mgmt.get() }
    }

    pub fn header(&self) -> &ChunkHeader {
        unsafe { &*self.mgmt().header.get() }
    }

    pub(crate) fn header_mut(&mut self) -> &mut ChunkHeader {
        unsafe { &mut *self.mgmt().header.get() }
    }

    /// The user payload bytes.
    pub fn payload(&self) -> &[u8] {
        let header = self.mgmt().header.get();
        unsafe {
            let p = ChunkHeader::payload_ptr(header);
            std::slice::from_raw_parts(p, (*header).payload_size as usize)
        }
    }

    /// The user payload bytes, writable.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header = self.mgmt().header.get();
        unsafe {
            let p = ChunkHeader::payload_ptr(header);
            std::slice::from_raw_parts_mut(p, (*header).payload_size as usize)
        }
    }

    pub fn payload_size(&self) -> u32 {
        self.header().payload_size
    }

    pub fn sequence(&self) -> u64 {
        self.header().sequence
    }

    /// Current refcount of the underlying record. Observational.
    pub fn ref_count(&self) -> u64 {
        self.mgmt().ref_count()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        ChunkManagement::release(self.mgmt);
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let h = self.header();
        f.debug_struct("Chunk")
            .field("payload_size", &h.payload_size)
            .field("sequence", &h.sequence)
            .field("origin_id", &h.origin_id)
            .finish()
    }
}
