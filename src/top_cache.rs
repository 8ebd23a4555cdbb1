// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Pins the upper `cached_levels` of the heap in memory and shards the
//! deeper subtrees across independent backend handles.
//!
//! Ports `pyoram/encrypted_storage/top_cached_encrypted_heap_storage.py`'s
//! `TopCachedEncryptedHeapStorage`: every bucket at level `cached_levels - 1`
//! becomes the root of an independent, lock-free `clone_device` handle, so a
//! path read/write only takes the main handle's lock for the cached prefix
//! of the path.

use crate::backend::BackendConfig;
use crate::crypto::Key;
use crate::error::{OramError, OramResult};
use crate::heap::{self, BucketIndex, Level};
use crate::heap_storage::EncryptedHeapStorage;
use rand::{CryptoRng, RngCore};
use std::collections::HashMap;

/// A heap-storage handle with its upper levels pinned in memory and its
/// lower subtrees sharded across independent handles.
pub struct TopCachedEncryptedHeapStorage {
    inner: EncryptedHeapStorage,
    cached_levels: Level,
    cache: HashMap<BucketIndex, Vec<u8>>,
    shards: HashMap<BucketIndex, EncryptedHeapStorage>,
}

impl TopCachedEncryptedHeapStorage {
    /// Wraps an already-open heap storage, reading every bucket at levels
    /// `[0, cached_levels)` into memory and cloning one shard handle per
    /// bucket at the boundary level `cached_levels - 1`.
    pub fn from_heap_storage(
        mut inner: EncryptedHeapStorage,
        cached_levels: Level,
    ) -> OramResult<Self> {
        if cached_levels == 0 {
            return Err(OramError::InvalidArgument(
                "cached_levels must be at least 1".into(),
            ));
        }
        if cached_levels > inner.heap_height() + 1 {
            return Err(OramError::InvalidArgument(format!(
                "cached_levels {cached_levels} exceeds heap height + 1 ({})",
                inner.heap_height() + 1
            )));
        }

        let mut cache = HashMap::new();
        for level in 0..cached_levels {
            let first = heap::first_bucket_at_level(inner.heap_base(), level)?;
            let last = heap::last_bucket_at_level(inner.heap_base(), level)?;
            for bucket in first..=last {
                cache.insert(bucket, inner.read_bucket(bucket)?);
            }
        }

        let mut shards = HashMap::new();
        let boundary_level = cached_levels - 1;
        let first = heap::first_bucket_at_level(inner.heap_base(), boundary_level)?;
        let last = heap::last_bucket_at_level(inner.heap_base(), boundary_level)?;
        for boundary in first..=last {
            shards.insert(boundary, inner.clone_device()?);
        }

        Ok(Self {
            inner,
            cached_levels,
            cache,
            shards,
        })
    }

    /// Opens the underlying heap storage and wraps it.
    pub fn open(
        backend_config: &BackendConfig,
        key: Key,
        cached_levels: Level,
        ignore_lock: bool,
    ) -> OramResult<Self> {
        let inner = EncryptedHeapStorage::open(backend_config, key, ignore_lock)?;
        Self::from_heap_storage(inner, cached_levels)
    }

    pub fn heap_base(&self) -> crate::heap::HeapBase {
        self.inner.heap_base()
    }

    pub fn heap_height(&self) -> Level {
        self.inner.heap_height()
    }

    pub fn bucket_byte_size(&self) -> u32 {
        self.inner.bucket_byte_size()
    }

    pub fn key(&self) -> &Key {
        self.inner.key()
    }

    pub fn header_data(&self) -> OramResult<Vec<u8>> {
        self.inner.header_data()
    }

    pub fn update_header_data<R: RngCore + CryptoRng>(
        &mut self,
        new_header: &[u8],
        rng: &mut R,
    ) -> OramResult<()> {
        self.inner.update_header_data(new_header, rng)
    }

    fn boundary_for(&self, path: &[BucketIndex]) -> OramResult<BucketIndex> {
        path.get(self.cached_levels as usize - 1)
            .copied()
            .ok_or_else(|| {
                OramError::InvalidArgument("path shorter than cached_levels".into())
            })
    }

    /// Reads the suffix of the root-to-`b` path starting at `level_start`,
    /// serving levels `< cached_levels` from the in-memory cache and deeper
    /// levels from the boundary bucket's shard handle.
    pub fn read_path(&mut self, b: BucketIndex, level_start: Level) -> OramResult<Vec<Vec<u8>>> {
        let path = heap::bucket_path_from_root(self.inner.heap_base(), b)?;
        let mut out = Vec::with_capacity(path.len());
        for (level, &bucket) in path.iter().enumerate() {
            let level = level as Level;
            if level < level_start {
                continue;
            }
            if level < self.cached_levels {
                let bytes = self
                    .cache
                    .get(&bucket)
                    .ok_or_else(|| OramError::InvalidArgument("bucket missing from cache".into()))?
                    .clone();
                out.push(bytes);
            } else {
                let boundary = self.boundary_for(&path)?;
                let shard = self.shards.get_mut(&boundary).ok_or_else(|| {
                    OramError::InvalidArgument(format!("no shard for boundary bucket {boundary}"))
                })?;
                out.push(shard.read_bucket(bucket)?);
            }
        }
        Ok(out)
    }

    /// Writes `buckets` onto the suffix of the root-to-`b` path starting at
    /// `level_start`. Upper-level writes only update the in-memory cache;
    /// they are not persisted until [`Self::close`].
    pub fn write_path<R: RngCore + CryptoRng>(
        &mut self,
        b: BucketIndex,
        buckets: &[Vec<u8>],
        level_start: Level,
        rng: &mut R,
    ) -> OramResult<()> {
        let path = heap::bucket_path_from_root(self.inner.heap_base(), b)?;
        let levels: Vec<Level> = (level_start..path.len() as Level).collect();
        if levels.len() != buckets.len() {
            return Err(OramError::InvalidArgument(format!(
                "write_path expected {} buckets, got {}",
                levels.len(),
                buckets.len()
            )));
        }
        for (level, bytes) in levels.into_iter().zip(buckets.iter()) {
            let bucket = path[level as usize];
            if level < self.cached_levels {
                self.cache.insert(bucket, bytes.clone());
            } else {
                let boundary = self.boundary_for(&path)?;
                let shard = self.shards.get_mut(&boundary).ok_or_else(|| {
                    OramError::InvalidArgument(format!("no shard for boundary bucket {boundary}"))
                })?;
                shard.write_bucket(bucket, bytes, rng)?;
            }
        }
        Ok(())
    }

    /// Writes every cached bucket back, closes each shard, then the
    /// underlying handle.
    pub fn close<R: RngCore + CryptoRng>(mut self, rng: &mut R) -> OramResult<()> {
        for (&bucket, bytes) in self.cache.iter() {
            self.inner.write_bucket(bucket, bytes, rng)?;
        }
        for (_, shard) in self.shards.into_iter() {
            shard.close()?;
        }
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ram_config(name: &str) -> BackendConfig {
        BackendConfig::Ram { name: name.into() }
    }

    #[test]
    fn write_then_read_round_trips_across_cache_boundary() {
        let mut rng = StdRng::seed_from_u64(9);
        let heap = EncryptedHeapStorage::setup(
            &ram_config("topcache-rt"),
            8,
            4,
            2,
            4,
            32,
            None,
            false,
            &mut rng,
        )
        .unwrap();
        let mut top = TopCachedEncryptedHeapStorage::from_heap_storage(heap, 2).unwrap();

        let leaf = 20u64; // deep enough to exercise both cache and shard
        let levels = heap::level(2, leaf).unwrap() + 1;
        let buckets: Vec<Vec<u8>> = (0..levels)
            .map(|l| vec![l as u8; top.bucket_byte_size() as usize])
            .collect();
        top.write_path(leaf, &buckets, 0, &mut rng).unwrap();
        assert_eq!(top.read_path(leaf, 0).unwrap(), buckets);
        top.close(&mut rng).unwrap();
    }

    #[test]
    fn level_start_skips_cached_prefix() {
        let mut rng = StdRng::seed_from_u64(10);
        let heap = EncryptedHeapStorage::setup(
            &ram_config("topcache-suffix"),
            8,
            4,
            2,
            4,
            32,
            None,
            false,
            &mut rng,
        )
        .unwrap();
        let mut top = TopCachedEncryptedHeapStorage::from_heap_storage(heap, 2).unwrap();
        let leaf = 20u64;
        let full = top.read_path(leaf, 0).unwrap();
        let suffix = top.read_path(leaf, 2).unwrap();
        assert_eq!(suffix, full[2..]);
        top.close(&mut rng).unwrap();
    }
}
