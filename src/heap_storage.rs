// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Interprets an [`EncryptedBlockStorage`] as a k-ary heap of fixed-capacity
//! buckets and exposes root-to-leaf path I/O.
//!
//! Ports `pyoram/storage/encrypted_heap_storage.py`'s `EncryptedHeapStorage`:
//! the heap geometry `(heap_base, heap_height, blocks_per_bucket)` lives in a
//! fixed 12-byte prefix of the encrypted user header so a reopen can recover
//! it without a side channel.

use crate::backend::BackendConfig;
use crate::encrypted_storage::EncryptedBlockStorage;
use crate::error::{OramError, OramResult};
use crate::heap::{self, BucketIndex, HeapBase, Level};
use rand::{CryptoRng, RngCore};

const GEOMETRY_PREFIX_SIZE: usize = 4 + 4 + 4;

/// A heap-shaped view over encrypted block storage: bucket `b` is
/// `blocks_per_bucket * payload_block_size` bytes, physically stored as one
/// block of the underlying [`EncryptedBlockStorage`].
pub struct EncryptedHeapStorage {
    storage: EncryptedBlockStorage,
    heap_base: HeapBase,
    heap_height: Level,
    blocks_per_bucket: u32,
    payload_block_size: u32,
}

fn bucket_index_to_u32(b: BucketIndex) -> OramResult<u32> {
    b.try_into()
        .map_err(|_| OramError::InvalidArgument(format!("bucket index {b} does not fit a u32")))
}

impl EncryptedHeapStorage {
    /// Creates a new heap-shaped storage: `bucket_count = (k^(h+1)-1)/(k-1)`
    /// buckets, each `blocks_per_bucket * payload_block_size` bytes, all
    /// initially zeroed (the Path ORAM layer tags every slot empty
    /// explicitly once this returns).
    #[allow(clippy::too_many_arguments)]
    pub fn setup<R: RngCore + CryptoRng>(
        backend_config: &BackendConfig,
        payload_block_size: u32,
        heap_height: Level,
        heap_base: HeapBase,
        blocks_per_bucket: u32,
        key_size: usize,
        header_data: Option<&[u8]>,
        ignore_existing: bool,
        rng: &mut R,
    ) -> OramResult<Self> {
        let bucket_count = bucket_index_to_u32(heap::bucket_count(heap_base, heap_height)?)?;
        let physical_bucket_size = blocks_per_bucket
            .checked_mul(payload_block_size)
            .ok_or_else(|| OramError::InvalidArgument("bucket size overflow".into()))?;

        let mut prefix = Vec::with_capacity(GEOMETRY_PREFIX_SIZE + header_data.map_or(0, <[u8]>::len));
        prefix.extend_from_slice(&heap_base.to_be_bytes());
        prefix.extend_from_slice(&heap_height.to_be_bytes());
        prefix.extend_from_slice(&blocks_per_bucket.to_be_bytes());
        prefix.extend_from_slice(header_data.unwrap_or(&[]));

        let storage = EncryptedBlockStorage::setup(
            backend_config,
            physical_bucket_size,
            bucket_count,
            key_size,
            Some(&prefix),
            None,
            ignore_existing,
            rng,
        )?;

        Ok(Self {
            storage,
            heap_base,
            heap_height,
            blocks_per_bucket,
            payload_block_size,
        })
    }

    /// Opens an existing heap-shaped storage, recovering the geometry from
    /// the stored prefix.
    pub fn open(backend_config: &BackendConfig, key: crate::crypto::Key, ignore_lock: bool) -> OramResult<Self> {
        let storage = EncryptedBlockStorage::open(backend_config, key, ignore_lock)?;
        let header = storage.header_data()?;
        if header.len() < GEOMETRY_PREFIX_SIZE {
            return Err(OramError::InvalidArgument(
                "heap storage header missing geometry prefix".into(),
            ));
        }
        let heap_base = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let heap_height = u32::from_be_bytes(header[4..8].try_into().unwrap());
        let blocks_per_bucket = u32::from_be_bytes(header[8..12].try_into().unwrap());
        let payload_block_size = storage
            .block_size()
            .checked_div(blocks_per_bucket)
            .ok_or_else(|| OramError::InvalidArgument("blocks_per_bucket is zero".into()))?;
        Ok(Self {
            storage,
            heap_base,
            heap_height,
            blocks_per_bucket,
            payload_block_size,
        })
    }

    pub fn heap_base(&self) -> HeapBase {
        self.heap_base
    }

    pub fn heap_height(&self) -> Level {
        self.heap_height
    }

    pub fn blocks_per_bucket(&self) -> u32 {
        self.blocks_per_bucket
    }

    pub fn payload_block_size(&self) -> u32 {
        self.payload_block_size
    }

    /// Size in bytes of one physical bucket: `blocks_per_bucket * payload_block_size`.
    pub fn bucket_byte_size(&self) -> u32 {
        self.storage.block_size()
    }

    pub fn key(&self) -> &crate::crypto::Key {
        self.storage.key()
    }

    /// The caller's own header bytes, i.e. everything after the geometry prefix.
    pub fn header_data(&self) -> OramResult<Vec<u8>> {
        Ok(self.storage.header_data()?[GEOMETRY_PREFIX_SIZE..].to_vec())
    }

    pub fn update_header_data<R: RngCore + CryptoRng>(
        &mut self,
        new_header: &[u8],
        rng: &mut R,
    ) -> OramResult<()> {
        let mut prefix = Vec::with_capacity(GEOMETRY_PREFIX_SIZE + new_header.len());
        prefix.extend_from_slice(&self.heap_base.to_be_bytes());
        prefix.extend_from_slice(&self.heap_height.to_be_bytes());
        prefix.extend_from_slice(&self.blocks_per_bucket.to_be_bytes());
        prefix.extend_from_slice(new_header);
        self.storage.update_header_data(&prefix, rng)
    }

    /// Reads bucket `b` directly, without regard to the path it lies on.
    /// Used by the top-cached wrapper to warm its cache and drive its
    /// per-subtree shard handles.
    pub fn read_bucket(&mut self, b: BucketIndex) -> OramResult<Vec<u8>> {
        self.storage.read_block(bucket_index_to_u32(b)?)
    }

    /// Writes bucket `b` directly, without regard to the path it lies on.
    pub fn write_bucket<R: RngCore + CryptoRng>(
        &mut self,
        b: BucketIndex,
        bytes: &[u8],
        rng: &mut R,
    ) -> OramResult<()> {
        self.storage.write_block(bucket_index_to_u32(b)?, bytes, rng)
    }

    /// Reads every bucket on the root-to-`b` path, root first.
    pub fn read_path(&mut self, b: BucketIndex) -> OramResult<Vec<Vec<u8>>> {
        heap::bucket_path_from_root(self.heap_base, b)?
            .into_iter()
            .map(|bucket| self.storage.read_block(bucket_index_to_u32(bucket)?))
            .collect()
    }

    /// Writes `buckets` (root first) onto the root-to-`b` path. `buckets`
    /// must have one entry per level on the path, each exactly
    /// [`Self::bucket_byte_size`] bytes.
    pub fn write_path<R: RngCore + CryptoRng>(
        &mut self,
        b: BucketIndex,
        buckets: &[Vec<u8>],
        rng: &mut R,
    ) -> OramResult<()> {
        let path = heap::bucket_path_from_root(self.heap_base, b)?;
        if path.len() != buckets.len() {
            return Err(OramError::InvalidArgument(format!(
                "write_path expected {} buckets, got {}",
                path.len(),
                buckets.len()
            )));
        }
        for (bucket, bytes) in path.into_iter().zip(buckets.iter()) {
            self.storage
                .write_block(bucket_index_to_u32(bucket)?, bytes, rng)?;
        }
        Ok(())
    }

    /// An independent handle onto the same physical storage, sharing the
    /// key, that does not hold the write lock.
    pub fn clone_device(&self) -> OramResult<Self> {
        Ok(Self {
            storage: self.storage.clone_device()?,
            heap_base: self.heap_base,
            heap_height: self.heap_height,
            blocks_per_bucket: self.blocks_per_bucket,
            payload_block_size: self.payload_block_size,
        })
    }

    pub fn close(self) -> OramResult<()> {
        self.storage.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ram_config(name: &str) -> BackendConfig {
        BackendConfig::Ram { name: name.into() }
    }

    #[test]
    fn read_path_length_matches_level_plus_one() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut heap = EncryptedHeapStorage::setup(
            &ram_config("heap-len"),
            8,
            3,
            2,
            4,
            32,
            None,
            false,
            &mut rng,
        )
        .unwrap();
        for b in [0u64, 1, 2, 6, 14] {
            let path = heap.read_path(b).unwrap();
            assert_eq!(path.len() as u32, heap::level(2, b).unwrap() + 1);
            for bucket in &path {
                assert_eq!(bucket.len() as u32, heap.bucket_byte_size());
            }
        }
        heap.close().unwrap();
    }

    #[test]
    fn write_path_then_read_path_round_trips() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut heap = EncryptedHeapStorage::setup(
            &ram_config("heap-rt"),
            8,
            3,
            2,
            4,
            32,
            None,
            false,
            &mut rng,
        )
        .unwrap();
        let leaf = 10u64;
        let levels = heap::level(2, leaf).unwrap() + 1;
        let buckets: Vec<Vec<u8>> = (0..levels)
            .map(|l| vec![l as u8; heap.bucket_byte_size() as usize])
            .collect();
        heap.write_path(leaf, &buckets, &mut rng).unwrap();
        assert_eq!(heap.read_path(leaf).unwrap(), buckets);
        heap.close().unwrap();
    }
}
