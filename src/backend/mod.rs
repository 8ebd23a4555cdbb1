// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The abstract block-storage backend (`spec.md` §4.3).
//!
//! `BlockStorage` is the capability trait every transport implements: a
//! fixed-size block array plus a small opaque user header and a
//! single-writer advisory lock, per the on-disk layout in `spec.md` §6.
//! Selection among backends is a tag-keyed factory (`spec.md` §9 DESIGN
//! NOTES: "Dynamic dispatch among backends should be expressed as a
//! capability trait ... no inheritance is required anywhere else").

pub mod file;
pub mod ram;

#[cfg(feature = "mmap")]
pub mod mmap;
#[cfg(feature = "s3")]
pub mod s3;
#[cfg(feature = "sftp")]
pub mod sftp;

use crate::error::{OramError, OramResult};

/// The fixed on-disk/on-wire index prefix shared by every backend:
/// `block_size: u32`, `block_count: u32`, `user_header_len: u32`,
/// `locked: u8`, big-endian, no padding (13 bytes total) — matches PyORAM's
/// `!LLL?` struct layout exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageHeader {
    /// Size in bytes of each block.
    pub block_size: u32,
    /// Number of blocks.
    pub block_count: u32,
    /// Length in bytes of the opaque user header that follows this prefix.
    pub user_header_len: u32,
    /// Single-writer advisory lock flag.
    pub locked: bool,
}

/// Byte length of the serialized [`StorageHeader`] prefix.
pub const STORAGE_HEADER_SIZE: usize = 4 + 4 + 4 + 1;

impl StorageHeader {
    /// Serializes this header to its fixed 13-byte on-wire form.
    pub fn to_bytes(self) -> [u8; STORAGE_HEADER_SIZE] {
        let mut out = [0u8; STORAGE_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.block_size.to_be_bytes());
        out[4..8].copy_from_slice(&self.block_count.to_be_bytes());
        out[8..12].copy_from_slice(&self.user_header_len.to_be_bytes());
        out[12] = self.locked as u8;
        out
    }

    /// Parses a [`StorageHeader`] from its fixed 13-byte on-wire form.
    pub fn from_bytes(bytes: &[u8]) -> OramResult<Self> {
        if bytes.len() < STORAGE_HEADER_SIZE {
            return Err(OramError::InvalidArgument(
                "storage header truncated".into(),
            ));
        }
        Ok(Self {
            block_size: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            block_count: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            user_header_len: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            locked: bytes[12] != 0,
        })
    }
}

/// Computes the on-wire byte count for a storage of the given shape, without
/// creating anything. Pure function per `spec.md` §4.3.
pub fn compute_storage_size(
    block_size: u32,
    block_count: u32,
    header_data: Option<&[u8]>,
    ignore_header: bool,
) -> OramResult<u64> {
    validate_shape(block_size, block_count)?;
    let header_len = header_data.map_or(0, |h| h.len());
    let body = block_size as u64 * block_count as u64;
    if ignore_header {
        Ok(body)
    } else {
        Ok(STORAGE_HEADER_SIZE as u64 + header_len as u64 + body)
    }
}

pub(crate) fn validate_shape(block_size: u32, block_count: u32) -> OramResult<()> {
    if block_size == 0 {
        return Err(OramError::InvalidArgument(
            "block size must be positive".into(),
        ));
    }
    if block_count == 0 {
        return Err(OramError::InvalidArgument(
            "block count must be positive".into(),
        ));
    }
    Ok(())
}

pub(crate) fn check_index(i: u32, block_count: u32) -> OramResult<()> {
    if i >= block_count {
        return Err(OramError::InvalidArgument(format!(
            "block index {i} out of range [0, {block_count})"
        )));
    }
    Ok(())
}

pub(crate) fn check_block_len(data: &[u8], block_size: u32) -> OramResult<()> {
    if data.len() != block_size as usize {
        return Err(OramError::InvalidArgument(format!(
            "block has length {}, expected {block_size}",
            data.len()
        )));
    }
    Ok(())
}

/// Writes a fresh `StorageHeader` plus `block_count` initial blocks to a
/// newly created file. Shared by [`file::FileBlockStorage::setup`] and
/// [`mmap::MmapBlockStorage::setup`], which differ only in how they later
/// read and write the same on-wire layout.
pub(crate) fn write_initial_file(
    f: &mut std::fs::File,
    block_size: u32,
    block_count: u32,
    header_data: Option<&[u8]>,
    mut initialize: Option<&mut dyn FnMut(u32) -> Vec<u8>>,
) -> OramResult<()> {
    use std::io::Write;

    let header_data = header_data.unwrap_or(&[]);
    let header = StorageHeader {
        block_size,
        block_count,
        user_header_len: header_data.len() as u32,
        locked: false,
    };
    f.write_all(&header.to_bytes())?;
    f.write_all(header_data)?;

    let zeros = vec![0u8; block_size as usize];
    for i in 0..block_count {
        let block = match initialize.as_deref_mut() {
            Some(cb) => cb(i),
            None => zeros.clone(),
        };
        check_block_len(&block, block_size)?;
        f.write_all(&block)?;
    }
    f.flush()?;
    Ok(())
}

/// The capability every block-storage transport implements.
///
/// Index-range checks, block-length checks, and the default `read_blocks`/
/// `write_blocks`/`yield_blocks` fan-outs are provided once here; a backend
/// need only implement the single-block primitives and lifecycle methods.
pub trait BlockStorage: Send {
    /// Size in bytes of each block.
    fn block_size(&self) -> u32;
    /// Number of blocks.
    fn block_count(&self) -> u32;
    /// The current opaque user header bytes.
    fn header_data(&self) -> Vec<u8>;

    /// Reads block `i`. Implementations must return exactly `block_size` bytes.
    fn read_block(&mut self, i: u32) -> OramResult<Vec<u8>>;
    /// Writes `data` (exactly `block_size` bytes) to slot `i`.
    fn write_block(&mut self, i: u32, data: &[u8]) -> OramResult<()>;

    /// Reads `indices` in the order given; duplicated indices yield
    /// duplicated blocks. Default: sequential `read_block` calls.
    fn read_blocks(&mut self, indices: &[u32]) -> OramResult<Vec<Vec<u8>>> {
        indices.iter().map(|&i| self.read_block(i)).collect()
    }

    /// Writes `blocks[j]` to `indices[j]` for each `j`. Default: sequential
    /// `write_block` calls, flushed before returning.
    fn write_blocks(&mut self, indices: &[u32], blocks: &[Vec<u8>]) -> OramResult<()> {
        if indices.len() != blocks.len() {
            return Err(OramError::InvalidArgument(
                "indices and blocks must have the same length".into(),
            ));
        }
        for (&i, block) in indices.iter().zip(blocks.iter()) {
            self.write_block(i, block)?;
        }
        self.flush()
    }

    /// Flushes any buffered writes. Default: a no-op for backends that write
    /// through immediately.
    fn flush(&mut self) -> OramResult<()> {
        Ok(())
    }

    /// Replaces the opaque user header. The new header must have the same
    /// length as the current one — headers are size-preserving in place.
    fn update_header_data(&mut self, new_header: &[u8]) -> OramResult<()>;

    /// Returns an independent handle onto the same underlying storage that
    /// does **not** take the write lock. Used by the top-cached heap-storage
    /// layer to obtain shard handles for parallel subtree access.
    fn clone_device(&self) -> OramResult<Box<dyn BlockStorage>>;

    /// Flushes, clears the locked flag (if this handle holds it), and
    /// releases resources.
    fn close(self: Box<Self>) -> OramResult<()>;
}

/// A lazily-evaluated, non-restartable sequence of block reads, borrowing
/// from the backend for the lifetime of the iteration (`spec.md` Design
/// Notes §9: "Generators / lazy block iteration ... should be represented as
/// a lazy finite sequence that borrows from the backend").
pub struct YieldBlocks<'a> {
    storage: &'a mut dyn BlockStorage,
    indices: std::vec::IntoIter<u32>,
}

impl<'a> YieldBlocks<'a> {
    /// Builds a lazy iterator that reads `indices` from `storage` one at a
    /// time as the iterator is driven forward.
    pub fn new(storage: &'a mut dyn BlockStorage, indices: Vec<u32>) -> Self {
        Self {
            storage,
            indices: indices.into_iter(),
        }
    }
}

impl<'a> Iterator for YieldBlocks<'a> {
    type Item = OramResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.indices.next()?;
        Some(self.storage.read_block(i))
    }
}

/// Names a backend kind, used by [`setup`]/[`open`] to dispatch to a
/// concrete [`BlockStorage`] constructor without the caller needing to name
/// the backend's type directly (`spec.md` §9 DESIGN NOTES' "small factory
/// that maps a tag ... to a backend constructor").
#[derive(Clone, Debug)]
pub enum BackendConfig {
    /// A plain local file at the given path.
    File { path: std::path::PathBuf },
    /// An in-process buffer named in the process-wide registry.
    Ram { name: String },
    /// A memory-mapped local file at the given path.
    #[cfg(feature = "mmap")]
    Mmap { path: std::path::PathBuf },
    /// An object-store prefix, addressed as `bucket`/`prefix`.
    #[cfg(feature = "s3")]
    S3 { bucket: String, prefix: String },
    /// A single remote file reachable over SFTP.
    #[cfg(feature = "sftp")]
    Sftp {
        endpoint: sftp::SftpEndpoint,
        remote_path: String,
    },
}

impl BackendConfig {
    /// Creates a new storage per this config's shape, returning an opened
    /// (locked) handle, same contract as each backend's own `setup`.
    pub fn setup(
        &self,
        block_size: u32,
        block_count: u32,
        header_data: Option<&[u8]>,
        initialize: Option<&mut dyn FnMut(u32) -> Vec<u8>>,
        ignore_existing: bool,
    ) -> OramResult<Box<dyn BlockStorage>> {
        match self {
            BackendConfig::File { path } => Ok(Box::new(file::FileBlockStorage::setup(
                path,
                block_size,
                block_count,
                header_data,
                initialize,
                ignore_existing,
            )?)),
            BackendConfig::Ram { name } => Ok(Box::new(ram::RamBlockStorage::setup(
                name.clone(),
                block_size,
                block_count,
                header_data,
                initialize,
                ignore_existing,
            )?)),
            #[cfg(feature = "mmap")]
            BackendConfig::Mmap { path } => Ok(Box::new(mmap::MmapBlockStorage::setup(
                path,
                block_size,
                block_count,
                header_data,
                initialize,
                ignore_existing,
            )?)),
            #[cfg(feature = "s3")]
            BackendConfig::S3 { bucket, prefix } => Ok(Box::new(s3::S3BlockStorage::setup(
                bucket.clone(),
                prefix.clone(),
                block_size,
                block_count,
                header_data,
                initialize,
                ignore_existing,
            )?)),
            #[cfg(feature = "sftp")]
            BackendConfig::Sftp {
                endpoint,
                remote_path,
            } => Ok(Box::new(sftp::SftpBlockStorage::setup(
                endpoint.clone(),
                remote_path.clone(),
                block_size,
                block_count,
                header_data,
                initialize,
                ignore_existing,
            )?)),
        }
    }

    /// Opens an existing storage per this config, same contract as each
    /// backend's own `open`.
    pub fn open(&self, ignore_lock: bool) -> OramResult<Box<dyn BlockStorage>> {
        match self {
            BackendConfig::File { path } => {
                Ok(Box::new(file::FileBlockStorage::open(path, ignore_lock)?))
            }
            BackendConfig::Ram { name } => Ok(Box::new(ram::RamBlockStorage::open(
                name.clone(),
                ignore_lock,
            )?)),
            #[cfg(feature = "mmap")]
            BackendConfig::Mmap { path } => {
                Ok(Box::new(mmap::MmapBlockStorage::open(path, ignore_lock)?))
            }
            #[cfg(feature = "s3")]
            BackendConfig::S3 { bucket, prefix } => Ok(Box::new(s3::S3BlockStorage::open(
                bucket.clone(),
                prefix.clone(),
                ignore_lock,
            )?)),
            #[cfg(feature = "sftp")]
            BackendConfig::Sftp {
                endpoint,
                remote_path,
            } => Ok(Box::new(sftp::SftpBlockStorage::open(
                endpoint.clone(),
                remote_path.clone(),
                ignore_lock,
            )?)),
        }
    }
}
