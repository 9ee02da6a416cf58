// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Shared memory handle tests: acquire modes, data visibility, and the
// cross-handle reference counting that drives unlink-on-last-close.

use std::sync::atomic::{AtomicUsize, Ordering};

use shmbus::{ShmHandle, ShmOpenMode};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_shm_{n}_{}", std::process::id())
}

#[test]
fn acquire_create() {
    let name = unique_name("acquire_create");
    ShmHandle::unlink_by_name(&name);

    let shm = ShmHandle::acquire(&name, 1024, ShmOpenMode::Create).expect("acquire create");
    assert!(shm.mapped_size() >= 1024);
    assert!(shm.is_creator());
    assert_ne!(shm.as_ptr() as usize, 0);
}

#[test]
fn acquire_open_nonexistent_fails() {
    let name = unique_name("acquire_open_fail");
    ShmHandle::unlink_by_name(&name);

    let result = ShmHandle::acquire(&name, 1024, ShmOpenMode::Open);
    assert!(result.is_err());
}

#[test]
fn create_exclusive_refuses_existing() {
    let name = unique_name("excl");
    ShmHandle::unlink_by_name(&name);

    let _first = ShmHandle::acquire(&name, 512, ShmOpenMode::Create).expect("first");
    let second = ShmHandle::acquire(&name, 512, ShmOpenMode::Create);
    assert!(second.is_err());
}

#[test]
fn data_is_visible_across_handles() {
    let name = unique_name("visible");
    ShmHandle::unlink_by_name(&name);

    let writer = ShmHandle::acquire(&name, 512, ShmOpenMode::Create).expect("writer");
    let reader = ShmHandle::acquire(&name, 512, ShmOpenMode::Open).expect("reader");
    assert!(!reader.is_creator());

    let test_data = b"zero copy or bust";
    unsafe {
        std::ptr::copy_nonoverlapping(test_data.as_ptr(), writer.as_mut_ptr(), test_data.len());
    }
    let read_back = unsafe { std::slice::from_raw_parts(reader.as_ptr(), test_data.len()) };
    assert_eq!(read_back, test_data);
}

#[test]
fn ref_count_tracks_handles() {
    let name = unique_name("refcount");
    ShmHandle::unlink_by_name(&name);

    let first = ShmHandle::acquire(&name, 128, ShmOpenMode::Create).expect("first");
    assert_eq!(first.ref_count(), 1);
    {
        let second = ShmHandle::acquire(&name, 128, ShmOpenMode::Open).expect("second");
        assert_eq!(second.ref_count(), 2);
        assert_eq!(first.ref_count(), 2);
    }
    assert_eq!(first.ref_count(), 1);
}

#[test]
fn fresh_segment_is_zero_filled() {
    let name = unique_name("zeroed");
    ShmHandle::unlink_by_name(&name);

    let shm = ShmHandle::acquire(&name, 256, ShmOpenMode::Create).expect("acquire");
    let bytes = unsafe { std::slice::from_raw_parts(shm.as_ptr(), 256) };
    assert!(bytes.iter().all(|&b| b == 0));
}
