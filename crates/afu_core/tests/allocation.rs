//! Allocation failures must not leak buffers that were already allocated.
//!
//! Kept in its own test binary with a single test, since the counting
//! allocator below observes every allocation in the process.

use afu_common::mmio::CACHELINE_BYTES;
use afu_core::AfuError;
use afu_core::buffer::AlignedBuffer;
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

struct Counting;

static LIVE_BYTES: AtomicUsize = AtomicUsize::new(0);

unsafe impl GlobalAlloc for Counting {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            LIVE_BYTES.fetch_add(layout.size(), Ordering::SeqCst);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if !ptr.is_null() {
            LIVE_BYTES.fetch_add(layout.size(), Ordering::SeqCst);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };
        LIVE_BYTES.fetch_sub(layout.size(), Ordering::SeqCst);
    }
}

#[global_allocator]
static GLOBAL: Counting = Counting;

/// Mirrors the host's setup: source first, then destination.
fn allocate_pair(size: usize, align: usize) -> Result<(AlignedBuffer, AlignedBuffer), AfuError> {
    let source = AlignedBuffer::allocate(4 * CACHELINE_BYTES, CACHELINE_BYTES)?;
    let destination = AlignedBuffer::allocate(size, align)?;
    Ok((source, destination))
}

#[test]
fn failed_second_allocation_releases_the_first() {
    // Warm up lazily initialised state (logging callsites) before measuring.
    drop(allocate_pair(512, CACHELINE_BYTES).unwrap());
    drop(allocate_pair(512, 3));
    let before = LIVE_BYTES.load(Ordering::SeqCst);

    for (size, align) in [(512, 96), (512, 0), (0, CACHELINE_BYTES), (512, 3)] {
        let result = allocate_pair(size, align);
        assert!(matches!(result, Err(AfuError::Allocation { .. })));
        assert_eq!(LIVE_BYTES.load(Ordering::SeqCst), before);
    }

    let pair = allocate_pair(512, CACHELINE_BYTES).unwrap();
    assert_eq!(LIVE_BYTES.load(Ordering::SeqCst), before + 1024);
    drop(pair);
    assert_eq!(LIVE_BYTES.load(Ordering::SeqCst), before);
}
