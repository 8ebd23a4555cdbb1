// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The Path ORAM protocol: a dense position map over logical ids, a stash of
//! displaced blocks, and the access sequence that keeps both consistent
//! while hiding which physical path an access touched.
//!
//! Ports `pyoram.tree.path_oram.PathORAM`. A block's public id `0..N` is
//! shifted by one on the wire (`manager::EMPTY_ID` reserves `0` for empty
//! slots); the stash and header digests are keyed on that same shifted id,
//! which is an implementation detail the caller never needs to interpret.

use crate::backend::BackendConfig;
use crate::crypto::Key;
use crate::digest;
use crate::error::{OramError, OramResult};
use crate::heap::{self, BucketIndex, HeapBase, Level};
use crate::heap_storage::EncryptedHeapStorage;
use crate::manager::{self, BlockId, TreeOramManager};
use crate::top_cache::TopCachedEncryptedHeapStorage;
use rand::{CryptoRng, RngCore};
use std::collections::BTreeMap;

/// Byte width of the digest prefix stamped into the Path ORAM header:
/// stash digest, position-map digest, then the logical block count.
const HEADER_PREFIX_SIZE: usize = digest::DIGEST_SIZE + digest::DIGEST_SIZE + 4;

/// A Path ORAM over `block_count` logical blocks, each `block_size` bytes.
pub struct PathOram {
    storage: TopCachedEncryptedHeapStorage,
    manager: TreeOramManager,
    position_map: Vec<BucketIndex>,
    stash: BTreeMap<BlockId, Vec<u8>>,
    heap_base: HeapBase,
    heap_height: Level,
    block_size: u32,
    block_count: u32,
}

fn internal_id(public_id: u32) -> BlockId {
    public_id + 1
}

fn to_digest_map(stash: &BTreeMap<BlockId, Vec<u8>>) -> BTreeMap<u64, Vec<u8>> {
    stash.iter().map(|(&id, bytes)| (id as u64, bytes.clone())).collect()
}

impl PathOram {
    /// Creates a new Path ORAM: `block_count` logical blocks of `block_size`
    /// bytes each, arranged on a base-`heap_base` heap with `bucket_capacity`
    /// slots per bucket. Every logical block is assigned a fresh random leaf
    /// and driven through one full access cycle with `initialize(i)` (or
    /// zero bytes, if omitted) as its content, exactly as a normal write
    /// would — so the on-disk layout leaving `setup` is indistinguishable
    /// from one produced by `block_count` ordinary writes.
    #[allow(clippy::too_many_arguments)]
    pub fn setup<R: RngCore + CryptoRng>(
        backend_config: &BackendConfig,
        block_size: u32,
        block_count: u32,
        bucket_capacity: u32,
        heap_base: HeapBase,
        key_size: usize,
        cached_levels: Level,
        header_data: Option<&[u8]>,
        mut initialize: Option<&mut dyn FnMut(u32) -> Vec<u8>>,
        ignore_existing: bool,
        rng: &mut R,
    ) -> OramResult<Self> {
        if block_count == 0 {
            return Err(OramError::InvalidArgument(
                "logical block count must be positive".into(),
            ));
        }
        let heap_height = heap::necessary_height(heap_base, block_count as u64)?;
        let record_size = block_size
            .checked_add(manager::INFO_SIZE as u32)
            .ok_or_else(|| OramError::InvalidArgument("block size overflow".into()))?;

        let mut prefix = vec![0u8; HEADER_PREFIX_SIZE];
        prefix[HEADER_PREFIX_SIZE - 4..].copy_from_slice(&block_count.to_be_bytes());
        prefix.extend_from_slice(header_data.unwrap_or(&[]));

        let mut heap_storage = EncryptedHeapStorage::setup(
            backend_config,
            record_size,
            heap_height,
            heap_base,
            bucket_capacity,
            key_size,
            Some(&prefix),
            ignore_existing,
            rng,
        )?;

        // Every bucket starts tagged all-empty: the backend's own zero-fill
        // is meaningless ciphertext, not a plaintext empty tag.
        let empty_slot = manager::tag_block_as_empty(block_size as usize);
        let mut empty_bucket = Vec::with_capacity(bucket_capacity as usize * record_size as usize);
        for _ in 0..bucket_capacity {
            empty_bucket.extend_from_slice(&empty_slot);
        }
        let bucket_count = heap::bucket_count(heap_base, heap_height)?;
        for b in 0..bucket_count {
            heap_storage.write_bucket(b, &empty_bucket, rng)?;
        }

        let storage = TopCachedEncryptedHeapStorage::from_heap_storage(heap_storage, cached_levels)?;
        let manager = TreeOramManager::new(heap_base, heap_height, bucket_capacity, block_size);

        let mut position_map = Vec::with_capacity(block_count as usize);
        for _ in 0..block_count {
            position_map.push(heap::random_leaf_bucket(heap_base, heap_height, rng)?);
        }

        let mut oram = Self {
            storage,
            manager,
            position_map,
            stash: BTreeMap::new(),
            heap_base,
            heap_height,
            block_size,
            block_count,
        };

        for i in 0..block_count {
            let payload = match initialize.as_deref_mut() {
                Some(cb) => cb(i),
                None => vec![0u8; block_size as usize],
            };
            if payload.len() as u32 != block_size {
                return Err(OramError::InvalidArgument(format!(
                    "initializer returned {} bytes for block {i}, expected {block_size}",
                    payload.len()
                )));
            }
            oram.access(i, Some(payload), rng)?;
        }

        oram.restamp_digests(rng)?;
        Ok(oram)
    }

    /// Reopens an existing Path ORAM under `key`, with the stash and
    /// position map the caller persisted at the previous [`Self::close`].
    /// Their digests must match what was stamped at that close.
    pub fn open(
        backend_config: &BackendConfig,
        key: Key,
        cached_levels: Level,
        stash: BTreeMap<BlockId, Vec<u8>>,
        position_map: Vec<BucketIndex>,
        ignore_lock: bool,
    ) -> OramResult<Self> {
        let heap_storage = EncryptedHeapStorage::open(backend_config, key, ignore_lock)?;
        let heap_base = heap_storage.heap_base();
        let heap_height = heap_storage.heap_height();
        let bucket_capacity = heap_storage.blocks_per_bucket();
        let block_size = heap_storage
            .payload_block_size()
            .checked_sub(manager::INFO_SIZE as u32)
            .ok_or_else(|| OramError::InvalidArgument("payload block smaller than info header".into()))?;

        let header = heap_storage.header_data()?;
        if header.len() < HEADER_PREFIX_SIZE {
            return Err(OramError::InvalidArgument(
                "path oram header missing digest prefix".into(),
            ));
        }
        let stored_stash_digest: [u8; digest::DIGEST_SIZE] =
            header[0..digest::DIGEST_SIZE].try_into().unwrap();
        let stored_position_digest: [u8; digest::DIGEST_SIZE] = header
            [digest::DIGEST_SIZE..2 * digest::DIGEST_SIZE]
            .try_into()
            .unwrap();
        let block_count = u32::from_be_bytes(
            header[2 * digest::DIGEST_SIZE..HEADER_PREFIX_SIZE]
                .try_into()
                .unwrap(),
        );

        if position_map.len() as u32 != block_count {
            return Err(OramError::InvalidArgument(format!(
                "position map has {} entries, expected {block_count}",
                position_map.len()
            )));
        }
        let stash_digest = digest::stash_digest(&to_digest_map(&stash))?;
        if stash_digest != stored_stash_digest {
            return Err(OramError::DigestMismatch(
                "supplied stash does not match the digest stamped at the last close".into(),
            ));
        }
        let position_digest = digest::position_map_digest(&position_map)?;
        if position_digest != stored_position_digest {
            return Err(OramError::DigestMismatch(
                "supplied position map does not match the digest stamped at the last close".into(),
            ));
        }

        let storage = TopCachedEncryptedHeapStorage::from_heap_storage(heap_storage, cached_levels)?;
        let manager = TreeOramManager::new(heap_base, heap_height, bucket_capacity, block_size);

        Ok(Self {
            storage,
            manager,
            position_map,
            stash,
            heap_base,
            heap_height,
            block_size,
            block_count,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn key(&self) -> &Key {
        self.storage.key()
    }

    /// The current stash, keyed by the shifted on-wire id. Persist this
    /// alongside [`Self::position_map`] between sessions.
    pub fn stash(&self) -> &BTreeMap<BlockId, Vec<u8>> {
        &self.stash
    }

    /// The current position map, one leaf bucket per logical id `0..block_count`.
    pub fn position_map(&self) -> &[BucketIndex] {
        &self.position_map
    }

    /// The caller's own header bytes, i.e. everything after the digest prefix.
    pub fn header_data(&self) -> OramResult<Vec<u8>> {
        Ok(self.storage.header_data()?[HEADER_PREFIX_SIZE..].to_vec())
    }

    pub fn update_header_data<R: RngCore + CryptoRng>(
        &mut self,
        new_header: &[u8],
        rng: &mut R,
    ) -> OramResult<()> {
        self.write_header(new_header, rng)
    }

    fn write_header<R: RngCore + CryptoRng>(&mut self, suffix: &[u8], rng: &mut R) -> OramResult<()> {
        let stash_digest = digest::stash_digest(&to_digest_map(&self.stash))?;
        let position_digest = digest::position_map_digest(&self.position_map)?;
        let mut header = Vec::with_capacity(HEADER_PREFIX_SIZE + suffix.len());
        header.extend_from_slice(&stash_digest);
        header.extend_from_slice(&position_digest);
        header.extend_from_slice(&self.block_count.to_be_bytes());
        header.extend_from_slice(suffix);
        self.storage.update_header_data(&header, rng)
    }

    fn restamp_digests<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> OramResult<()> {
        let current = self.storage.header_data()?;
        let suffix = if current.len() >= HEADER_PREFIX_SIZE {
            current[HEADER_PREFIX_SIZE..].to_vec()
        } else {
            Vec::new()
        };
        self.write_header(&suffix, rng)
    }

    /// Accesses logical block `public_id`: reassigns it a fresh random leaf,
    /// pulls its current content off the path or out of the stash, optionally
    /// overwrites it, reinserts it into the stash, then shuffles the path
    /// (push-down, stash-fill, evict) so every occupied slot stays on a
    /// legal level for its assigned leaf. Returns the pre-write content when
    /// `write_block` is `None`.
    pub fn access<R: RngCore + CryptoRng>(
        &mut self,
        public_id: u32,
        write_block: Option<Vec<u8>>,
        rng: &mut R,
    ) -> OramResult<Option<Vec<u8>>> {
        if public_id >= self.block_count {
            return Err(OramError::InvalidArgument(format!(
                "block id {public_id} out of range [0, {})",
                self.block_count
            )));
        }
        if let Some(wb) = &write_block {
            if wb.len() as u32 != self.block_size {
                return Err(OramError::InvalidArgument(format!(
                    "block has length {}, expected {}",
                    wb.len(),
                    self.block_size
                )));
            }
        }

        log::debug!(
            "access -- id {public_id}, write {}",
            write_block.is_some()
        );
        let id = internal_id(public_id);
        let old_leaf = self.position_map[public_id as usize];
        let new_leaf = heap::random_leaf_bucket(self.heap_base, self.heap_height, rng)?;
        self.position_map[public_id as usize] = new_leaf;

        let position_map = std::mem::take(&mut self.position_map);
        let leaf_of = |id: BlockId| position_map[(id - 1) as usize];

        self.manager.load_path(&mut self.storage, old_leaf, &leaf_of)?;

        let found = self
            .manager
            .extract_block_from_path(id)
            .or_else(|| self.stash.remove(&id));
        if found.is_none() && write_block.is_none() {
            self.position_map = position_map;
            return Err(OramError::InvalidArgument(format!(
                "block {public_id} missing from both path and stash"
            )));
        }
        let mut block = found.unwrap_or_default();

        let result = if write_block.is_none() {
            Some(block.clone())
        } else {
            None
        };
        if let Some(wb) = write_block {
            block = wb;
        }
        self.stash.insert(id, block);

        self.manager.push_down_path()?;
        self.manager.fill_path_from_stash(&mut self.stash, &leaf_of)?;
        self.manager.evict_path(&mut self.storage, rng)?;

        self.position_map = position_map;
        Ok(result)
    }

    /// Reads logical block `id`.
    pub fn read_block<R: RngCore + CryptoRng>(&mut self, id: u32, rng: &mut R) -> OramResult<Vec<u8>> {
        self.access(id, None, rng)?
            .ok_or_else(|| OramError::InvalidArgument("access returned no payload for a read".into()))
    }

    /// Writes `bytes` to logical block `id`.
    pub fn write_block<R: RngCore + CryptoRng>(
        &mut self,
        id: u32,
        bytes: &[u8],
        rng: &mut R,
    ) -> OramResult<()> {
        self.access(id, Some(bytes.to_vec()), rng)?;
        Ok(())
    }

    /// Reads each id in `ids`, in order, as a sequence of independent accesses.
    pub fn read_blocks<R: RngCore + CryptoRng>(
        &mut self,
        ids: &[u32],
        rng: &mut R,
    ) -> OramResult<Vec<Vec<u8>>> {
        ids.iter().map(|&id| self.read_block(id, rng)).collect()
    }

    /// Writes each `blocks[j]` to `ids[j]`, in order, as a sequence of
    /// independent accesses.
    pub fn write_blocks<R: RngCore + CryptoRng>(
        &mut self,
        ids: &[u32],
        blocks: &[Vec<u8>],
        rng: &mut R,
    ) -> OramResult<()> {
        if ids.len() != blocks.len() {
            return Err(OramError::InvalidArgument(
                "ids and blocks must have the same length".into(),
            ));
        }
        for (&id, bytes) in ids.iter().zip(blocks.iter()) {
            self.write_block(id, bytes, rng)?;
        }
        Ok(())
    }

    /// Restamps the stash/position-map digests and closes the underlying
    /// storage. The caller must persist [`Self::stash`] and
    /// [`Self::position_map`] (captured before this call) to pass to the
    /// next [`Self::open`].
    pub fn close<R: RngCore + CryptoRng>(mut self, rng: &mut R) -> OramResult<()> {
        self.restamp_digests(rng)?;
        self.storage.close(rng)
    }
}
