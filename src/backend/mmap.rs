// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A memory-mapped-file block-storage backend.
//!
//! Same on-wire layout as [`super::file::FileBlockStorage`]
//! (`pyoram.storage.block_storage_mmap.BlockStorageMmap` uses an identical
//! index/header/block layout to the plain file backend; only the I/O path
//! differs), but reads and writes go through a `memmap2::MmapMut` instead of
//! `Seek`+`Read`/`Write`.

use super::{check_block_len, check_index, validate_shape, write_initial_file, BlockStorage, StorageHeader};
use crate::error::{OramError, OramResult};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// A block-storage backend over a memory-mapped local file.
pub struct MmapBlockStorage {
    file: File,
    map: MmapMut,
    path: PathBuf,
    header: StorageHeader,
    data_offset: usize,
    holds_lock: bool,
}

impl MmapBlockStorage {
    fn block_range(&self, i: u32) -> std::ops::Range<usize> {
        let start = self.data_offset + i as usize * self.header.block_size as usize;
        start..start + self.header.block_size as usize
    }

    /// Creates a new memory-mapped storage at `path`, identical in shape and
    /// semantics to [`super::file::FileBlockStorage::setup`].
    pub fn setup(
        path: impl AsRef<Path>,
        block_size: u32,
        block_count: u32,
        header_data: Option<&[u8]>,
        initialize: Option<&mut dyn FnMut(u32) -> Vec<u8>>,
        ignore_existing: bool,
    ) -> OramResult<Self> {
        let path = path.as_ref();
        validate_shape(block_size, block_count)?;
        if !ignore_existing && path.exists() {
            return Err(OramError::AlreadyExists(path.display().to_string()));
        }

        let result = (|| -> OramResult<()> {
            let mut f = File::create(path)?;
            write_initial_file(&mut f, block_size, block_count, header_data, initialize)
        })();

        if let Err(e) = result {
            let _ = std::fs::remove_file(path);
            return Err(OramError::SetupFailed(e.to_string()));
        }

        Self::open(path, false)
    }

    /// Opens an existing memory-mapped storage.
    pub fn open(path: impl AsRef<Path>, ignore_lock: bool) -> OramResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(OramError::NotFound(path.display().to_string()));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        let header = StorageHeader::from_bytes(&map[..super::STORAGE_HEADER_SIZE])?;
        if header.locked && !ignore_lock {
            return Err(OramError::Locked(path.display().to_string()));
        }

        if !ignore_lock {
            let locked_header = StorageHeader {
                locked: true,
                ..header
            };
            map[..super::STORAGE_HEADER_SIZE].copy_from_slice(&locked_header.to_bytes());
            map.flush()?;
        }

        let data_offset = super::STORAGE_HEADER_SIZE + header.user_header_len as usize;
        Ok(Self {
            file,
            map,
            path: path.to_path_buf(),
            header,
            data_offset,
            holds_lock: !ignore_lock,
        })
    }
}

impl BlockStorage for MmapBlockStorage {
    fn block_size(&self) -> u32 {
        self.header.block_size
    }

    fn block_count(&self) -> u32 {
        self.header.block_count
    }

    fn header_data(&self) -> Vec<u8> {
        self.map[super::STORAGE_HEADER_SIZE..self.data_offset].to_vec()
    }

    fn read_block(&mut self, i: u32) -> OramResult<Vec<u8>> {
        log::trace!("Physical read -- {i}");
        check_index(i, self.header.block_count)?;
        Ok(self.map[self.block_range(i)].to_vec())
    }

    fn write_block(&mut self, i: u32, data: &[u8]) -> OramResult<()> {
        log::trace!("Physical write -- {i}");
        check_index(i, self.header.block_count)?;
        check_block_len(data, self.header.block_size)?;
        let range = self.block_range(i);
        self.map[range].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> OramResult<()> {
        self.map.flush()?;
        Ok(())
    }

    fn update_header_data(&mut self, new_header: &[u8]) -> OramResult<()> {
        let current_len = self.data_offset - super::STORAGE_HEADER_SIZE;
        if new_header.len() != current_len {
            return Err(OramError::InvalidArgument(format!(
                "header size cannot change: was {current_len}, got {}",
                new_header.len()
            )));
        }
        self.map[super::STORAGE_HEADER_SIZE..self.data_offset].copy_from_slice(new_header);
        self.map.flush()?;
        Ok(())
    }

    fn clone_device(&self) -> OramResult<Box<dyn BlockStorage>> {
        Ok(Box::new(Self::open(&self.path, true)?))
    }

    fn close(mut self: Box<Self>) -> OramResult<()> {
        if self.holds_lock {
            let unlocked = StorageHeader {
                locked: false,
                ..self.header
            };
            self.map[..super::STORAGE_HEADER_SIZE].copy_from_slice(&unlocked.to_bytes());
            self.map.flush()?;
        }
        drop(self.map);
        drop(self.file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_reads_and_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a");
        let mut storage = MmapBlockStorage::setup(&path, 4, 4, None, None, false).unwrap();
        storage.write_block(1, &[1, 2, 3, 4]).unwrap();
        assert_eq!(storage.read_block(1).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(storage.read_block(0).unwrap(), vec![0, 0, 0, 0]);
        Box::new(storage).close().unwrap();
        assert!(MmapBlockStorage::open(&path, false).is_ok());
    }
}
