//! Storage block accounting for `CowData`.
//!
//! Kept in its own test binary with a single test: the allocator counters are
//! process-wide, so any concurrently running test would disturb them.

use hearth_core::memory::alloc;
use hearth_core::{CoreError, CowData};
use std::thread;

#[test]
fn test_every_block_is_freed_when_handles_drop() {
    let baseline = alloc::stats();

    {
        let mut base = CowData::new();
        for i in 0..100_u32 {
            base.push(format!("item {i}")).unwrap();
        }
        assert_eq!(alloc::stats().live_blocks, baseline.live_blocks + 1);

        // Shared copies reuse the block.
        let mut copies: Vec<CowData<String>> = (0..4).map(|_| base.clone()).collect();
        assert_eq!(alloc::stats().live_blocks, baseline.live_blocks + 1);

        // Each fork takes a block of its own.
        copies[0].set(0, String::from("forked"));
        copies[1].insert(3, String::from("inserted")).unwrap();
        copies[2].truncate(10);
        assert_eq!(alloc::stats().live_blocks, baseline.live_blocks + 4);

        // Growing, shrinking and removing only move blocks around.
        copies[0].resize(500).unwrap();
        copies[1].resize(1).unwrap();
        let removed = copies[2].remove(0);
        assert_eq!(removed, "item 0");
        assert_eq!(alloc::stats().live_blocks, baseline.live_blocks + 4);

        // A rejected resize allocates nothing.
        let err = copies[3].resize(usize::MAX).unwrap_err();
        assert!(matches!(err, CoreError::InvalidParameter { .. }));
        assert_eq!(alloc::stats().live_blocks, baseline.live_blocks + 4);

        // Handles dropped on other threads release their references too.
        let handles: Vec<_> = copies
            .drain(..)
            .map(|copy| thread::spawn(move || drop(copy)))
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(alloc::stats().live_blocks, baseline.live_blocks + 1);

        let mut other = CowData::from_slice(&[String::from("x")]).unwrap();
        other.assign(&base);
        base.clear();
        assert_eq!(other.len(), 100);
        assert_eq!(alloc::stats().live_blocks, baseline.live_blocks + 1);
    }

    let after = alloc::stats();
    assert_eq!(after.live_blocks, baseline.live_blocks);
    assert_eq!(after.live_bytes, baseline.live_bytes);
    assert!(after.total_allocations > baseline.total_allocations);
}
