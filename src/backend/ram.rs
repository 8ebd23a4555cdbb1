// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An in-memory block-storage backend, keyed by a name in a process-wide
//! registry so that independent handles (including `clone_device` shards)
//! can open the "same" storage without going to disk. Used for tests and
//! for scenario 6 of `spec.md` §8 (backend-agnostic equivalence).

use super::{check_block_len, check_index, validate_shape, BlockStorage};
use crate::error::{OramError, OramResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

struct RamStorageInner {
    block_size: u32,
    blocks: Vec<Vec<u8>>,
    user_header: Vec<u8>,
    locked: bool,
}

fn registry() -> &'static Mutex<HashMap<String, Arc<Mutex<RamStorageInner>>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Mutex<RamStorageInner>>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A block-storage backend over an in-process buffer.
pub struct RamBlockStorage {
    name: String,
    inner: Arc<Mutex<RamStorageInner>>,
    holds_lock: bool,
}

impl RamBlockStorage {
    /// Creates an in-memory storage named `name`, sized for `block_count`
    /// blocks of `block_size` bytes, filled via `initialize` (zeros by
    /// default), and returns an opened (locked) handle.
    pub fn setup(
        name: impl Into<String>,
        block_size: u32,
        block_count: u32,
        header_data: Option<&[u8]>,
        mut initialize: Option<&mut dyn FnMut(u32) -> Vec<u8>>,
        ignore_existing: bool,
    ) -> OramResult<Self> {
        let name = name.into();
        validate_shape(block_size, block_count)?;
        let mut reg = registry().lock().unwrap();
        if !ignore_existing && reg.contains_key(&name) {
            return Err(OramError::AlreadyExists(name));
        }

        let zeros = vec![0u8; block_size as usize];
        let mut blocks = Vec::with_capacity(block_count as usize);
        for i in 0..block_count {
            let block = match initialize.as_deref_mut() {
                Some(cb) => cb(i),
                None => zeros.clone(),
            };
            check_block_len(&block, block_size)?;
            blocks.push(block);
        }

        reg.insert(
            name.clone(),
            Arc::new(Mutex::new(RamStorageInner {
                block_size,
                blocks,
                user_header: header_data.unwrap_or(&[]).to_vec(),
                locked: false,
            })),
        );
        drop(reg);
        Self::open(name, false)
    }

    /// Opens an existing in-memory storage by name.
    pub fn open(name: impl Into<String>, ignore_lock: bool) -> OramResult<Self> {
        let name = name.into();
        let inner = {
            let reg = registry().lock().unwrap();
            reg.get(&name)
                .cloned()
                .ok_or_else(|| OramError::NotFound(name.clone()))?
        };
        {
            let mut guard = inner.lock().unwrap();
            if guard.locked && !ignore_lock {
                return Err(OramError::Locked(name));
            }
            if !ignore_lock {
                guard.locked = true;
            }
        }
        Ok(Self {
            name,
            inner,
            holds_lock: !ignore_lock,
        })
    }

    /// Removes the named in-memory storage entirely.
    pub fn remove(name: &str) {
        registry().lock().unwrap().remove(name);
    }
}

impl BlockStorage for RamBlockStorage {
    fn block_size(&self) -> u32 {
        self.inner.lock().unwrap().block_size
    }

    fn block_count(&self) -> u32 {
        self.inner.lock().unwrap().blocks.len() as u32
    }

    fn header_data(&self) -> Vec<u8> {
        self.inner.lock().unwrap().user_header.clone()
    }

    fn read_block(&mut self, i: u32) -> OramResult<Vec<u8>> {
        log::trace!("Physical read -- {i}");
        let guard = self.inner.lock().unwrap();
        check_index(i, guard.blocks.len() as u32)?;
        Ok(guard.blocks[i as usize].clone())
    }

    fn write_block(&mut self, i: u32, data: &[u8]) -> OramResult<()> {
        log::trace!("Physical write -- {i}");
        let mut guard = self.inner.lock().unwrap();
        check_index(i, guard.blocks.len() as u32)?;
        check_block_len(data, guard.block_size)?;
        guard.blocks[i as usize] = data.to_vec();
        Ok(())
    }

    fn update_header_data(&mut self, new_header: &[u8]) -> OramResult<()> {
        let mut guard = self.inner.lock().unwrap();
        if new_header.len() != guard.user_header.len() {
            return Err(OramError::InvalidArgument(format!(
                "header size cannot change: was {}, got {}",
                guard.user_header.len(),
                new_header.len()
            )));
        }
        guard.user_header = new_header.to_vec();
        Ok(())
    }

    fn clone_device(&self) -> OramResult<Box<dyn BlockStorage>> {
        Ok(Box::new(Self::open(self.name.clone(), true)?))
    }

    fn close(self: Box<Self>) -> OramResult<()> {
        if self.holds_lock {
            self.inner.lock().unwrap().locked = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        format!("{tag}-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[test]
    fn round_trips_reads_and_writes() {
        let name = unique_name("rw");
        let mut storage = RamBlockStorage::setup(&name, 4, 4, None, None, false).unwrap();
        storage.write_block(2, &[9, 9, 9, 9]).unwrap();
        assert_eq!(storage.read_block(2).unwrap(), vec![9, 9, 9, 9]);
        assert_eq!(storage.read_block(0).unwrap(), vec![0, 0, 0, 0]);
        RamBlockStorage::remove(&name);
    }

    #[test]
    fn locking_is_enforced_across_handles() {
        let name = unique_name("lock");
        let _locked = RamBlockStorage::setup(&name, 4, 1, None, None, false).unwrap();
        assert!(matches!(
            RamBlockStorage::open(&name, false),
            Err(OramError::Locked(_))
        ));
        assert!(RamBlockStorage::open(&name, true).is_ok());
        RamBlockStorage::remove(&name);
    }
}
