// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Tiered allocation tests: best-fit tier selection, exhaustion without
// fallback, and refcount discipline down to the free lists.

use std::sync::atomic::{AtomicUsize, Ordering};

use shmbus::chunk::ChunkHeader;
use shmbus::segment::{allocate_segment_id, DataSegment};
use shmbus::LoanError;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn segment(prefix: &str, tiers: &[(u64, u64)]) -> DataSegment {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("sbus_{prefix}_pool_{n}_{}", std::process::id());
    DataSegment::create(&name, allocate_segment_id(), tiers).expect("segment")
}

#[test]
fn loan_uses_smallest_fitting_tier() {
    let seg = segment("tiers", &[(128, 4), (1024, 4)]);
    let memory = seg.memory();

    let small = memory.loan(32, 8).expect("small loan");
    let stats = memory.pool_stats();
    assert_eq!(stats[0].used, 1, "small payload lands in the 128 tier");
    assert_eq!(stats[1].used, 0);

    let large = memory.loan(512, 8).expect("large loan");
    let stats = memory.pool_stats();
    assert_eq!(stats[0].used, 1);
    assert_eq!(stats[1].used, 1, "large payload lands in the 1024 tier");

    drop(small);
    drop(large);
    let stats = memory.pool_stats();
    assert_eq!(stats[0].used, 0);
    assert_eq!(stats[1].used, 0);
}

#[test]
fn exhausted_tier_never_falls_back() {
    let seg = segment("nofallback", &[(128, 1), (1024, 4)]);
    let memory = seg.memory();

    let _held = memory.loan(32, 8).expect("first loan");
    // The best-fit tier is empty; a larger tier exists but is not used.
    assert_eq!(memory.loan(32, 8).unwrap_err(), LoanError::OutOfChunks);
    assert_eq!(memory.pool_stats()[1].used, 0);
}

#[test]
fn oversized_payload_is_rejected() {
    let seg = segment("toolarge", &[(256, 4)]);
    let err = seg.memory().loan(4096, 8).unwrap_err();
    assert!(matches!(err, LoanError::ChunkTooLarge { payload_size: 4096 }));
}

#[test]
fn refcount_discipline_frees_on_last_release() {
    let seg = segment("refcount", &[(256, 4)]);
    let memory = seg.memory();

    let chunk = memory.loan(64, 8).expect("loan");
    assert_eq!(chunk.ref_count(), 1);
    assert_eq!(memory.pool_stats()[0].used, 1);
    assert_eq!(memory.mgmt_records_in_use(), 1);

    drop(chunk);
    assert_eq!(memory.pool_stats()[0].used, 0);
    assert_eq!(memory.mgmt_records_in_use(), 0);
}

#[test]
fn payload_pointer_roundtrips_to_header() {
    let seg = segment("roundtrip", &[(256, 4)]);
    let mut chunk = seg.memory().loan(16, 8).expect("loan");
    chunk.payload_mut().fill(0xAB);

    let payload_ptr = chunk.payload().as_ptr() as *mut u8;
    let header = ChunkHeader::from_payload(payload_ptr);
    unsafe {
        assert_eq!((*header).payload_size, 16);
        assert_eq!(
            ChunkHeader::payload_ptr(header) as usize,
            payload_ptr as usize
        );
    }
}

#[test]
fn alignment_request_is_honoured() {
    let seg = segment("align", &[(1024, 4)]);
    for align in [8u32, 16, 64, 256] {
        let chunk = seg.memory().loan(32, align).expect("loan");
        assert_eq!(chunk.payload().as_ptr() as usize % align as usize, 0);
    }
}

#[test]
fn loans_from_many_threads_stay_disjoint() {
    let seg = segment("threads", &[(256, 64)]);
    let memory = seg.memory();

    std::thread::scope(|s| {
        for t in 0..4u8 {
            let memory = memory.clone();
            s.spawn(move || {
                for i in 0..500u32 {
                    match memory.loan(64, 8) {
                        Ok(mut chunk) => {
                            let stamp = (t as u32) << 16 | i;
                            chunk.payload_mut()[..4].copy_from_slice(&stamp.to_le_bytes());
                            let mut back = [0u8; 4];
                            back.copy_from_slice(&chunk.payload()[..4]);
                            assert_eq!(u32::from_le_bytes(back), stamp);
                        }
                        Err(LoanError::OutOfChunks) => std::thread::yield_now(),
                        Err(e) => panic!("unexpected loan failure: {e}"),
                    }
                }
            });
        }
    });

    assert_eq!(memory.pool_stats()[0].used, 0);
    assert_eq!(memory.mgmt_records_in_use(), 0);
}
