// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Tiered chunk allocation over a segment's pools.
//
// A MemoryManager is the process-local view of one payload segment: the
// ordered pool tiers plus the dedicated management-record pool. Loans pick
// the smallest tier whose blocks fit header + padding + payload. A loan
// never falls back to a larger tier when the best fit is exhausted — that
// would trade bounded latency for occasional luck.

use crate::chunk::{Chunk, ChunkHeader, ChunkManagement};
use crate::error::LoanError;
use crate::pool::MemPool;
use crate::rel_ptr::RelPtr;

/// Process-local handle to a segment's pools.
pub struct MemoryManager {
    segment_id: u64,
    /// Pool tiers, ascending block size.
    pools: Vec<RelPtr<MemPool>>,
    /// Dedicated pool for ChunkManagement records.
    mgmt_pool: RelPtr<MemPool>,
}

/// Observational snapshot of one pool tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub block_size: u64,
    pub block_count: u64,
    pub used: u64,
}

impl MemoryManager {
    /// Assemble from resolved pool pointers. `pools` must be sorted by
    /// ascending block size (the segment layout guarantees this).
    pub fn new(segment_id: u64, pools: Vec<RelPtr<MemPool>>, mgmt_pool: RelPtr<MemPool>) -> Self {
        Self {
            segment_id,
            pools,
            mgmt_pool,
        }
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// Loan a chunk able to hold `payload_size` bytes at `payload_align`.
    ///
    /// Wait-free on the uncontended path. The returned handle holds the
    /// initial reference; dropping it (or the last clone of its reference)
    /// returns the block to the pool it came from.
    pub fn loan(&self, payload_size: u64, payload_align: u32) -> Result<Chunk, LoanError> {
        let required = ChunkHeader::required_chunk_size(payload_size, payload_align);

        let tier = self
            .pools
            .iter()
            .copied()
            .find(|p| unsafe { (*p.get()).block_size() } >= required);
        let tier = match tier {
            Some(t) => t,
            None => return Err(LoanError::ChunkTooLarge { payload_size }),
        };

        let pool = unsafe { &*tier.get() };
        let block = pool.get_chunk().ok_or(LoanError::OutOfChunks)?;

        let mgmt_pool = unsafe { &*self.mgmt_pool.get() };
        let mgmt_block = match mgmt_pool.get_chunk() {
            Some(b) => b as *mut ChunkManagement,
            None => {
                pool.free_chunk(block);
                return Err(LoanError::OutOfChunks);
            }
        };

        let mgmt_rel = RelPtr::from_addr(mgmt_block as *const ChunkManagement);
        unsafe {
            let header = ChunkHeader::write_new(
                block,
                pool.block_size() as u32,
                payload_size as u32,
                payload_align,
                mgmt_rel,
            );
            ChunkManagement::init_in_place(
                mgmt_block,
                RelPtr::from_addr(header),
                tier,
                self.mgmt_pool,
            );
            Ok(Chunk::from_rel(mgmt_rel))
        }
    }

    /// Snapshot of every pool tier. Observational.
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools
            .iter()
            .map(|p| {
                let pool = unsafe { &*p.get() };
                PoolStats {
                    block_size: pool.block_size(),
                    block_count: pool.get_chunk_count(),
                    used: pool.get_used_chunk_count(),
                }
            })
            .collect()
    }

    /// Used-count of the management-record pool. Observational.
    pub fn mgmt_records_in_use(&self) -> u64 {
        unsafe { &*self.mgmt_pool.get() }.get_used_chunk_count()
    }
}
