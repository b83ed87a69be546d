//! Randomized model check of `CowData` against `Vec`.
//!
//! Every handle mirrors a plain vector. After each operation all live
//! handles must still match their mirrors, which catches writes leaking
//! through a shared block.

use hearth_core::memory::alloc;
use hearth_core::{CoreError, CowData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const HANDLES: usize = 4;
const STEPS: usize = 5_000;

fn check(handles: &[CowData<u64>], mirrors: &[Vec<u64>]) {
    for (i, (handle, mirror)) in handles.iter().zip(mirrors).enumerate() {
        assert_eq!(handle.as_slice(), mirror.as_slice(), "handle {i} diverged");
        assert_eq!(handle.len(), mirror.len());
        assert_eq!(handle.is_empty(), mirror.is_empty());
    }
}

#[test]
fn test_cow_matches_vec_model() {
    let mut rng = StdRng::seed_from_u64(0x4845_4152_5448);
    let mut handles: Vec<CowData<u64>> = (0..HANDLES).map(|_| CowData::new()).collect();
    let mut mirrors: Vec<Vec<u64>> = vec![Vec::new(); HANDLES];

    for _ in 0..STEPS {
        let h = rng.gen_range(0..HANDLES);
        let len = mirrors[h].len();
        match rng.gen_range(0..8) {
            0 => {
                let value = rng.gen();
                handles[h].push(value).unwrap();
                mirrors[h].push(value);
            }
            1 => {
                let pos = rng.gen_range(0..=len);
                let value = rng.gen();
                handles[h].insert(pos, value).unwrap();
                mirrors[h].insert(pos, value);
            }
            2 if len > 0 => {
                let pos = rng.gen_range(0..len);
                assert_eq!(handles[h].remove(pos), mirrors[h].remove(pos));
            }
            3 if len > 0 => {
                let pos = rng.gen_range(0..len);
                let value = rng.gen();
                handles[h].set(pos, value);
                mirrors[h][pos] = value;
            }
            4 => {
                let new_len = rng.gen_range(0..64);
                handles[h].resize(new_len).unwrap();
                mirrors[h].resize(new_len, 0);
            }
            5 => {
                let src = rng.gen_range(0..HANDLES);
                let copy = handles[src].clone();
                handles[h] = copy;
                mirrors[h] = mirrors[src].clone();
            }
            6 => {
                let src = rng.gen_range(0..HANDLES);
                let source = handles[src].clone();
                handles[h].assign(&source);
                mirrors[h] = mirrors[src].clone();
            }
            7 if len > 0 => {
                let new_len = rng.gen_range(0..len);
                handles[h].truncate(new_len);
                mirrors[h].truncate(new_len);
            }
            _ => {
                handles[h].clear();
                mirrors[h].clear();
            }
        }
        check(&handles, &mirrors);
    }
}

#[test]
fn test_refcount_tracks_handles() {
    let a = CowData::from_slice(&[1_u64, 2, 3]).unwrap();
    let copies: Vec<_> = (0..5).map(|_| a.clone()).collect();
    assert_eq!(a.refcount(), 6);
    assert!(copies.iter().all(|c| CowData::ptr_eq(c, &a)));

    drop(copies);
    assert_eq!(a.refcount(), 1);
    assert!(!a.is_shared());
}

#[test]
fn test_find_and_bytes() {
    let data = CowData::from_slice(&[3_u32, 5, 3, 7]).unwrap();
    assert_eq!(data.find(&3, 0), Some(0));
    assert_eq!(data.find(&3, 1), Some(2));
    assert_eq!(data.find(&9, 0), None);
    assert_eq!(data.find(&3, 10), None);
    assert_eq!(data.as_bytes().len(), 16);

    let collected: CowData<u32> = (0..4).collect();
    assert_eq!(collected, [0, 1, 2, 3]);
}

#[test]
fn test_insert_past_end_is_rejected() {
    let mut data = CowData::from_slice(&[1_u8, 2]).unwrap();
    let err = data.insert(3, 9).unwrap_err();
    assert!(matches!(err, CoreError::InvalidParameter { .. }));
    assert_eq!(data, [1, 2]);
}

#[test]
fn test_fork_allocates_a_new_block() {
    // Other tests in this binary allocate concurrently; the counter is
    // monotonic, so a lower bound is all that can be asserted.
    let before = alloc::stats().total_allocations;
    let mut a = CowData::from_slice(&[1_u64; 32]).unwrap();
    let b = a.clone();
    a.set(0, 2);
    assert!(alloc::stats().total_allocations >= before + 2);
    assert_eq!(b[0], 1);
    assert_eq!(a[0], 2);
}
