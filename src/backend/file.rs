// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A plain-file block-storage backend.
//!
//! Ports `pyoram.storage.block_storage_file.BlockStorageFile`: the on-wire
//! layout is the shared [`super::StorageHeader`] prefix, the opaque user
//! header, then `block_count` fixed-size blocks, written with
//! `Seek`+`Write`/`Read`.

use super::{check_block_len, check_index, validate_shape, write_initial_file, BlockStorage, StorageHeader};
use crate::error::{OramError, OramResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A block-storage backend over a single local file.
pub struct FileBlockStorage {
    file: File,
    path: PathBuf,
    header: StorageHeader,
    user_header: Vec<u8>,
    data_offset: u64,
    holds_lock: bool,
}

impl FileBlockStorage {
    fn data_offset(header: &StorageHeader) -> u64 {
        super::STORAGE_HEADER_SIZE as u64 + header.user_header_len as u64
    }

    fn block_offset(&self, i: u32) -> u64 {
        self.data_offset + i as u64 * self.header.block_size as u64
    }

    /// Creates a new file at `path` sized for `block_count` blocks of
    /// `block_size` bytes, writes `header_data` (or an empty header), fills
    /// each block with `initialize(i)` (zeros by default), and returns an
    /// opened (locked) handle. On any failure the file is removed, leaving
    /// no partially created storage (`spec.md` §7, `setup-failed`).
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

    /// Opens an existing file-backed storage. Fails with `Locked` if the
    /// advisory lock is set and `ignore_lock` is `false`; otherwise sets the
    /// lock (unless `ignore_lock` is `true`, in which case this handle never
    /// touches the lock).
    pub fn open(path: impl AsRef<Path>, ignore_lock: bool) -> OramResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(OramError::NotFound(path.display().to_string()));
        }
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut prefix = [0u8; super::STORAGE_HEADER_SIZE];
        file.read_exact(&mut prefix)?;
        let header = StorageHeader::from_bytes(&prefix)?;

        if header.locked && !ignore_lock {
            return Err(OramError::Locked(path.display().to_string()));
        }

        let mut user_header = vec![0u8; header.user_header_len as usize];
        file.read_exact(&mut user_header)?;

        if !ignore_lock {
            let locked_header = StorageHeader {
                locked: true,
                ..header
            };
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&locked_header.to_bytes())?;
            file.flush()?;
        }

        Ok(Self {
            data_offset: Self::data_offset(&header),
            file,
            path: path.to_path_buf(),
            header,
            user_header,
            holds_lock: !ignore_lock,
        })
    }
}

impl BlockStorage for FileBlockStorage {
    fn block_size(&self) -> u32 {
        self.header.block_size
    }

    fn block_count(&self) -> u32 {
        self.header.block_count
    }

    fn header_data(&self) -> Vec<u8> {
        self.user_header.clone()
    }

    fn read_block(&mut self, i: u32) -> OramResult<Vec<u8>> {
        log::trace!("Physical read -- {i}");
        check_index(i, self.header.block_count)?;
        let mut buf = vec![0u8; self.header.block_size as usize];
        self.file.seek(SeekFrom::Start(self.block_offset(i)))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_block(&mut self, i: u32, data: &[u8]) -> OramResult<()> {
        log::trace!("Physical write -- {i}");
        check_index(i, self.header.block_count)?;
        check_block_len(data, self.header.block_size)?;
        self.file.seek(SeekFrom::Start(self.block_offset(i)))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> OramResult<()> {
        self.file.flush()?;
        Ok(())
    }

    fn update_header_data(&mut self, new_header: &[u8]) -> OramResult<()> {
        if new_header.len() != self.user_header.len() {
            return Err(OramError::InvalidArgument(format!(
                "header size cannot change: was {}, got {}",
                self.user_header.len(),
                new_header.len()
            )));
        }
        self.user_header = new_header.to_vec();
        self.file
            .seek(SeekFrom::Start(super::STORAGE_HEADER_SIZE as u64))?;
        self.file.write_all(&self.user_header)?;
        self.file.flush()?;
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
            self.file.seek(SeekFrom::Start(0))?;
            self.file.write_all(&unlocked.to_bytes())?;
            self.file.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn path_for(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn setup_then_read_matches_initializer() {
        let dir = tempdir().unwrap();
        let path = path_for(&dir, "a");
        let mut init = |i: u32| vec![i as u8; 8];
        let mut storage =
            FileBlockStorage::setup(&path, 8, 4, None, Some(&mut init), false).unwrap();
        for i in 0..4u32 {
            assert_eq!(storage.read_block(i).unwrap(), vec![i as u8; 8]);
        }
        Box::new(storage).close().unwrap();
    }

    #[test]
    fn write_then_read_round_trips_and_leaves_others_untouched() {
        let dir = tempdir().unwrap();
        let path = path_for(&dir, "a");
        let mut storage = FileBlockStorage::setup(&path, 4, 3, None, None, false).unwrap();
        storage.write_block(1, &[9, 9, 9, 9]).unwrap();
        assert_eq!(storage.read_block(1).unwrap(), vec![9, 9, 9, 9]);
        assert_eq!(storage.read_block(0).unwrap(), vec![0, 0, 0, 0]);
        assert_eq!(storage.read_block(2).unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn setup_without_ignore_existing_fails_on_existing_path() {
        let dir = tempdir().unwrap();
        let path = path_for(&dir, "a");
        FileBlockStorage::setup(&path, 4, 1, None, None, false).unwrap();
        let err = FileBlockStorage::setup(&path, 4, 1, None, None, false);
        assert!(matches!(err, Err(OramError::AlreadyExists(_))));
    }

    #[test]
    fn open_locked_storage_without_ignore_lock_fails() {
        let dir = tempdir().unwrap();
        let path = path_for(&dir, "a");
        let _locked = FileBlockStorage::setup(&path, 4, 1, None, None, false).unwrap();
        let err = FileBlockStorage::open(&path, false);
        assert!(matches!(err, Err(OramError::Locked(_))));
        let reopened = FileBlockStorage::open(&path, true);
        assert!(reopened.is_ok());
    }

    #[test]
    fn close_clears_lock_for_subsequent_open() {
        let dir = tempdir().unwrap();
        let path = path_for(&dir, "a");
        let storage = FileBlockStorage::setup(&path, 4, 1, None, None, false).unwrap();
        Box::new(storage).close().unwrap();
        assert!(FileBlockStorage::open(&path, false).is_ok());
    }

    #[test]
    fn update_header_data_rejects_size_change() {
        let dir = tempdir().unwrap();
        let path = path_for(&dir, "a");
        let mut storage =
            FileBlockStorage::setup(&path, 4, 1, Some(b"abcd"), None, false).unwrap();
        assert!(storage.update_header_data(b"xyz").is_err());
        storage.update_header_data(b"wxyz").unwrap();
        assert_eq!(storage.header_data(), b"wxyz".to_vec());
    }

    #[test]
    fn setup_failure_leaves_no_artifact() {
        let dir = tempdir().unwrap();
        let path = path_for(&dir, "a");
        let mut bad_init = |_: u32| vec![0u8; 3]; // wrong length triggers failure
        let err = FileBlockStorage::setup(&path, 4, 2, None, Some(&mut bad_init), false);
        assert!(matches!(err, Err(OramError::SetupFailed(_))));
        assert!(!path.exists());
    }

    #[test]
    fn read_blocks_preserves_order_and_duplicates() {
        let dir = tempdir().unwrap();
        let path = path_for(&dir, "a");
        let mut init = |i: u32| vec![i as u8];
        let mut storage =
            FileBlockStorage::setup(&path, 1, 4, None, Some(&mut init), false).unwrap();
        let blocks = storage.read_blocks(&[2, 0, 2]).unwrap();
        assert_eq!(blocks, vec![vec![2], vec![0], vec![2]]);
    }
}
