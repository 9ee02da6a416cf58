// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Segment creation and mapping.
//
// The broker creates one payload segment per access group at startup and
// never resizes it. Each segment starts with a fixed-layout header (magic,
// version, id, total size, pool table) followed by the pool records, their
// free lists, and the block arrays, each 64-byte aligned. Clients map the
// same segment during the handshake, verify the header, and rebuild their
// process-local MemoryManager from the pool table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::chunk::ChunkManagement;
use crate::config::BrokerConfig;
use crate::error::SegmentError;
use crate::memory::MemoryManager;
use crate::pool::{align_up, MemPool};
use crate::rel_ptr::{self, RelPtr, SegmentToken};
use crate::shm::{ShmHandle, ShmOpenMode};
use crate::shm_name;

const SEGMENT_MAGIC: u32 = u32::from_le_bytes(*b"SHMB");
const SEGMENT_VERSION: u32 = 1;

/// Fixed-layout header at the start of every payload segment.
#[repr(C)]
struct SegmentHeader {
    magic: u32,
    version: u32,
    segment_id: u64,
    total_size: u64,
    /// Payload tiers; the pool table has one extra trailing entry for the
    /// chunk-management pool.
    pool_count: u32,
    _pad: u32,
    constructed: AtomicBool,
}

/// Pool table entry following the header.
#[repr(C)]
#[derive(Clone, Copy)]
struct PoolDesc {
    block_size: u64,
    block_count: u64,
    /// Offset of the MemPool record from the segment base.
    pool_offset: u64,
}

/// Computed placement of one pool inside the segment.
struct PoolPlacement {
    block_size: u64,
    block_count: u64,
    pool_offset: u64,
    freelist_offset: u64,
    blocks_offset: u64,
}

fn pool_table_offset() -> u64 {
    align_up(std::mem::size_of::<SegmentHeader>() as u64, 8)
}

/// Block arrays start on a page boundary and block sizes are rounded to 64
/// bytes, so a payload alignment up to 4096 holds on every block whose size
/// is a multiple of that alignment.
const BLOCK_ARRAY_ALIGN: u64 = 4096;

/// Lay out `tiers` plus the trailing management pool. Returns the
/// placements and the total segment size.
fn layout(tiers: &[(u64, u64)]) -> (Vec<PoolPlacement>, u64) {
    let mgmt_block_size = align_up(std::mem::size_of::<ChunkManagement>() as u64, 64);
    let mgmt_block_count: u64 = tiers.iter().map(|&(_, c)| c).sum();

    let mut all: Vec<(u64, u64)> = tiers
        .iter()
        .map(|&(s, c)| (align_up(s, 64), c))
        .collect();
    all.push((mgmt_block_size, mgmt_block_count));

    let table_len = all.len() as u64 * std::mem::size_of::<PoolDesc>() as u64;
    let mut cursor = align_up(pool_table_offset() + table_len, 64);

    let mut placements = Vec::with_capacity(all.len());
    for (block_size, block_count) in all {
        let pool_offset = cursor;
        cursor = align_up(cursor + std::mem::size_of::<MemPool>() as u64, 64);
        let freelist_offset = cursor;
        cursor = align_up(cursor + block_count * 4, BLOCK_ARRAY_ALIGN);
        let blocks_offset = cursor;
        cursor = align_up(cursor + block_size * block_count, 64);
        placements.push(PoolPlacement {
            block_size,
            block_count,
            pool_offset,
            freelist_offset,
            blocks_offset,
        });
    }
    (placements, cursor)
}

/// Summary of one segment, as exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub name: String,
    pub segment_id: u64,
    pub size: u64,
}

/// One mapped payload segment plus its registration and allocator view.
pub struct DataSegment {
    _shm: ShmHandle,
    /// `None` when the segment was already registered in this process
    /// (broker and client runtime sharing one process).
    _token: Option<SegmentToken>,
    info: SegmentInfo,
    memory: Arc<MemoryManager>,
}

impl DataSegment {
    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    fn build_memory(base: *mut u8, segment_id: u64) -> Arc<MemoryManager> {
        let header = base as *const SegmentHeader;
        let pool_count = unsafe { (*header).pool_count };
        let table =
            unsafe { base.add(pool_table_offset() as usize) as *const PoolDesc };

        let mut pools = Vec::with_capacity(pool_count as usize);
        for i in 0..pool_count {
            let desc = unsafe { *table.add(i as usize) };
            pools.push(RelPtr::<MemPool>::from_parts(segment_id, desc.pool_offset));
        }
        let mgmt_desc = unsafe { *table.add(pool_count as usize) };
        let mgmt_pool = RelPtr::<MemPool>::from_parts(segment_id, mgmt_desc.pool_offset);

        Arc::new(MemoryManager::new(segment_id, pools, mgmt_pool))
    }

    /// Create and construct a segment (broker side).
    pub fn create(
        name: &str,
        segment_id: u64,
        tiers: &[(u64, u64)],
    ) -> Result<Self, SegmentError> {
        let (placements, total) = layout(tiers);
        let shm = ShmHandle::acquire(name, total as usize, ShmOpenMode::CreateOrOpen)?;
        let base = shm.as_mut_ptr();

        let token = match rel_ptr::register_segment(segment_id, base, total as usize) {
            Ok(t) => Some(t),
            Err(rel_ptr::RegisterError::AlreadyRegistered(_)) => None,
            Err(e) => {
                return Err(SegmentError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    e.to_string(),
                )))
            }
        };

        unsafe {
            let header = base as *mut SegmentHeader;
            (*header).magic = SEGMENT_MAGIC;
            (*header).version = SEGMENT_VERSION;
            (*header).segment_id = segment_id;
            (*header).total_size = total;
            (*header).pool_count = placements.len() as u32 - 1;

            let table = base.add(pool_table_offset() as usize) as *mut PoolDesc;
            for (i, p) in placements.iter().enumerate() {
                *table.add(i) = PoolDesc {
                    block_size: p.block_size,
                    block_count: p.block_count,
                    pool_offset: p.pool_offset,
                };
                MemPool::init_in_place(
                    base.add(p.pool_offset as usize) as *mut MemPool,
                    p.block_size,
                    p.block_count,
                    segment_id,
                    p.freelist_offset,
                    p.blocks_offset,
                );
            }
            (*header).constructed.store(true, Ordering::Release);
        }

        let memory = Self::build_memory(base, segment_id);
        log::info!(
            "segment {name} created: id {segment_id}, {} pool tiers, {total} bytes",
            placements.len() - 1
        );
        Ok(Self {
            _shm: shm,
            _token: token,
            info: SegmentInfo {
                name: name.to_owned(),
                segment_id,
                size: total,
            },
            memory,
        })
    }

    /// Map and verify an existing segment (client side).
    pub fn open(info: &SegmentInfo) -> Result<Self, SegmentError> {
        let shm = ShmHandle::acquire(&info.name, info.size as usize, ShmOpenMode::Open)?;
        let base = shm.as_mut_ptr();

        unsafe {
            let header = base as *const SegmentHeader;
            if (*header).magic != SEGMENT_MAGIC
                || (*header).version != SEGMENT_VERSION
                || !(*header).constructed.load(Ordering::Acquire)
                || (*header).segment_id != info.segment_id
            {
                return Err(SegmentError::BadHeader {
                    name: info.name.clone(),
                });
            }
        }

        let token = match rel_ptr::register_segment(info.segment_id, base, info.size as usize) {
            Ok(t) => Some(t),
            // Broker and client runtime inside one process share a mapping.
            Err(rel_ptr::RegisterError::AlreadyRegistered(_)) => None,
            Err(e) => {
                return Err(SegmentError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    e.to_string(),
                )))
            }
        };

        let memory = Self::build_memory(base, info.segment_id);
        Ok(Self {
            _shm: shm,
            _token: token,
            info: info.clone(),
            memory,
        })
    }
}

/// Broker-side owner of every payload segment.
pub struct SegmentManager {
    segments: Vec<DataSegment>,
}

/// Segment ids are allocated per broker process and travel to clients in
/// the segment header and handshake, so they stay consistent across
/// processes without further coordination.
static NEXT_SEGMENT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// Reserve a fresh segment id for this process.
pub fn allocate_segment_id() -> u64 {
    NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed)
}

impl SegmentManager {
    /// Create one segment per access group from a validated configuration.
    pub fn create(config: &BrokerConfig) -> Result<Self, SegmentError> {
        let mut segments = Vec::new();
        for group in config.access_groups() {
            let tiers: Vec<(u64, u64)> = config
                .pools_of(&group)
                .iter()
                .map(|p| (p.size, p.count as u64))
                .collect();
            let name = shm_name::segment_name(&config.domain, &group);
            let segment_id = allocate_segment_id();
            segments.push(DataSegment::create(&name, segment_id, &tiers)?);
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[DataSegment] {
        &self.segments
    }

    pub fn segment_infos(&self) -> Vec<SegmentInfo> {
        self.segments.iter().map(|s| s.info.clone()).collect()
    }

    /// The allocator of the first (default) segment.
    pub fn default_memory(&self) -> Arc<MemoryManager> {
        Arc::clone(self.segments[0].memory())
    }
}
