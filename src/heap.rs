// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Pure integer arithmetic on k-ary bucket heaps.
//!
//! Every function here is a direct port of the bucket-level algebra in
//! `pyoram.tree.virtualheap` (`CalculateBucketLevel`,
//! `CalculateLastCommonLevel`, `CalculateNecessaryHeapHeight`, and friends):
//! no I/O, no randomness except `random_leaf_bucket`.

use crate::error::{OramError, OramResult};
use rand::{CryptoRng, RngCore};
use static_assertions::const_assert_eq;

/// The heap base `k` (number of children per internal bucket).
pub type HeapBase = u32;
/// A 0-based bucket index within the heap.
pub type BucketIndex = u64;
/// A 0-based level within the heap; the root is level 0.
pub type Level = u32;

const_assert_eq!(std::mem::size_of::<BucketIndex>(), 8);

fn check_base(k: HeapBase) -> OramResult<()> {
    if k < 2 {
        return Err(OramError::InvalidArgument(format!(
            "heap base must be >= 2, got {k}"
        )));
    }
    Ok(())
}

/// The level at which bucket `b` lives in a heap of base `k`.
///
/// Specializes to `bit_length(b+1) - 1` for `k == 2`; otherwise walks up from
/// `h = 0` until `k^(h+1) >= (k-1)(b+1)+1`.
pub fn level(k: HeapBase, b: BucketIndex) -> OramResult<Level> {
    check_base(k)?;
    if k == 2 {
        return Ok(crate::util::log2_floor(b + 1));
    }
    let v = (k as u128 - 1) * (b as u128 + 1) + 1;
    let mut h: u32 = 0;
    while (k as u128).pow(h + 1) < v {
        h += 1;
    }
    Ok(h)
}

/// The first bucket index at level `l`: `(k^l - 1) / (k - 1)`.
pub fn first_bucket_at_level(k: HeapBase, l: Level) -> OramResult<BucketIndex> {
    check_base(k)?;
    let numerator = (k as u128).pow(l) - 1;
    Ok((numerator / (k as u128 - 1)) as BucketIndex)
}

/// The last bucket index at level `l`: `first_bucket_at_level(l+1) - 1`.
pub fn last_bucket_at_level(k: HeapBase, l: Level) -> OramResult<BucketIndex> {
    Ok(first_bucket_at_level(k, l + 1)? - 1)
}

/// The number of buckets in a heap of base `k` and height `h`.
pub fn bucket_count(k: HeapBase, h: Level) -> OramResult<BucketIndex> {
    first_bucket_at_level(k, h + 1)
}

/// The parent of bucket `b` (undefined, and not called, for `b == 0`).
fn parent(k: HeapBase, b: BucketIndex) -> BucketIndex {
    (b - 1) / (k as u64)
}

/// The highest level at which the root-to-`b1` and root-to-`b2` paths
/// coincide. Runs in `O(h)`: walk the deeper bucket up until the levels
/// match, then walk both up in lockstep until the bucket indices match.
pub fn last_common_level(k: HeapBase, b1: BucketIndex, b2: BucketIndex) -> OramResult<Level> {
    check_base(k)?;
    let mut l1 = level(k, b1)?;
    let mut l2 = level(k, b2)?;
    let mut b1 = b1;
    let mut b2 = b2;
    while l1 > l2 {
        b1 = parent(k, b1);
        l1 -= 1;
    }
    while l2 > l1 {
        b2 = parent(k, b2);
        l2 -= 1;
    }
    while b1 != b2 {
        b1 = parent(k, b1);
        b2 = parent(k, b2);
        l1 -= 1;
    }
    Ok(l1)
}

/// The sequence of buckets from the root (index 0) to `b`, inclusive, in
/// root-to-leaf order. `bucket_path_from_root(b).last() == Some(b)`.
pub fn bucket_path_from_root(k: HeapBase, b: BucketIndex) -> OramResult<Vec<BucketIndex>> {
    check_base(k)?;
    let mut path = vec![b];
    let mut current = b;
    while current != 0 {
        current = parent(k, current);
        path.push(current);
    }
    path.reverse();
    Ok(path)
}

/// The smallest height `h` such that a k-ary heap of that height has at
/// least `n` leaves (`k^h >= n`).
pub fn necessary_height(k: HeapBase, n: u64) -> OramResult<Level> {
    check_base(k)?;
    if n == 0 {
        return Err(OramError::InvalidArgument(
            "logical block count must be positive".into(),
        ));
    }
    let mut h: u32 = 0;
    while (k as u128).pow(h) < n as u128 {
        h += 1;
    }
    Ok(h)
}

/// Samples a uniformly random leaf bucket at level `h`, using a
/// cryptographically secure RNG. The uniform distribution over
/// `[first_bucket_at_level(h), last_bucket_at_level(h)]` is a security
/// requirement of Path ORAM, not a convenience: a biased sampler leaks
/// information about which physical path an access will touch.
pub fn random_leaf_bucket<R: RngCore + CryptoRng>(
    k: HeapBase,
    h: Level,
    rng: &mut R,
) -> OramResult<BucketIndex> {
    let first = first_bucket_at_level(k, h)?;
    let last = last_bucket_at_level(k, h)?;
    let span = last - first + 1;
    Ok(first + (rng.next_u64() % span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn level_matches_log2_for_binary_heap() {
        for b in 0..1000u64 {
            assert_eq!(level(2, b).unwrap(), crate::util::log2_floor(b + 1));
        }
    }

    #[test]
    fn bucket_path_ends_at_bucket_and_has_correct_length() {
        for k in [2, 3, 4, 5] {
            for b in 0..500u64 {
                let path = bucket_path_from_root(k, b).unwrap();
                assert_eq!(*path.last().unwrap(), b);
                assert_eq!(path.len() as u32, level(k, b).unwrap() + 1);
            }
        }
    }

    #[test]
    fn last_common_level_bounds_and_ancestor_case() {
        for k in [2, 3, 4] {
            for b1 in 1..200u64 {
                for b2 in 1..200u64 {
                    let lcl = last_common_level(k, b1, b2).unwrap();
                    let l1 = level(k, b1).unwrap();
                    let l2 = level(k, b2).unwrap();
                    assert!(lcl <= l1.min(l2));

                    let p1 = bucket_path_from_root(k, b1).unwrap();
                    let p2 = bucket_path_from_root(k, b2).unwrap();
                    let is_ancestor = p1.len() <= p2.len() && p2.starts_with(&p1)
                        || p2.len() <= p1.len() && p1.starts_with(&p2);
                    if is_ancestor {
                        assert_eq!(lcl, l1.min(l2));
                    }
                }
            }
        }
    }

    #[test]
    fn level_counts_grow_by_k_to_the_l() {
        for k in [2u32, 3, 4, 5] {
            for l in 0..8u32 {
                let diff = first_bucket_at_level(k, l + 1).unwrap()
                    - first_bucket_at_level(k, l).unwrap();
                assert_eq!(diff, (k as u64).pow(l));
            }
        }
    }

    #[test]
    fn necessary_height_is_smallest_sufficient() {
        for n in 1..300u64 {
            let h = necessary_height(2, n).unwrap();
            assert!(2u64.pow(h) >= n);
            if h > 0 {
                assert!(2u64.pow(h - 1) < n);
            }
        }
    }

    #[test]
    fn random_leaf_bucket_is_in_range_and_varies() {
        let mut rng = StdRng::seed_from_u64(42);
        let h = 8;
        let first = first_bucket_at_level(2, h).unwrap();
        let last = last_bucket_at_level(2, h).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2000 {
            let leaf = random_leaf_bucket(2, h, &mut rng).unwrap();
            assert!((first..=last).contains(&leaf));
            seen.insert(leaf);
        }
        assert!(seen.len() > 100);
    }

    #[test]
    fn rejects_heap_base_below_two() {
        assert!(level(1, 0).is_err());
        assert!(necessary_height(1, 4).is_err());
    }
}
