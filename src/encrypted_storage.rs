// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Transparent per-block AES-CTR encryption over a [`BlockStorage`] backend.
//!
//! Ports `pyoram.storage.block_storage.EncryptedBlockStorage`: the physical
//! block size on the wrapped backend is the logical size plus
//! [`crate::crypto::IV_SIZE`] (payload plus a fresh IV per write), and the
//! opaque backend header holds the AES-CTR ciphertext of the logical user
//! header. This layer holds the key; it adds no index state of its own.

use crate::backend::{BackendConfig, BlockStorage};
use crate::crypto::{self, Key, IV_SIZE};
use crate::error::{OramError, OramResult};
use rand::{CryptoRng, RngCore};

/// A block-storage handle that transparently encrypts every block and the
/// user header under a single AES-CTR key.
pub struct EncryptedBlockStorage {
    backend: Box<dyn BlockStorage>,
    key: Key,
    logical_block_size: u32,
}

fn check_len(data: &[u8], expected: u32) -> OramResult<()> {
    if data.len() as u32 != expected {
        return Err(OramError::InvalidArgument(format!(
            "block has length {}, expected {expected}",
            data.len()
        )));
    }
    Ok(())
}

impl EncryptedBlockStorage {
    /// Creates a backend of physical size `block_size + IV_SIZE` via
    /// `backend_config`, generates a fresh key of `key_size` bytes, encrypts
    /// `header_data` onto it, and (if `initialize` is given) writes every
    /// slot through the normal encrypt-then-write path so each physical
    /// block carries its own fresh IV from the start.
    #[allow(clippy::too_many_arguments)]
    pub fn setup<R: RngCore + CryptoRng>(
        backend_config: &BackendConfig,
        block_size: u32,
        block_count: u32,
        key_size: usize,
        header_data: Option<&[u8]>,
        mut initialize: Option<&mut dyn FnMut(u32) -> Vec<u8>>,
        ignore_existing: bool,
        rng: &mut R,
    ) -> OramResult<Self> {
        let key = Key::generate(key_size, rng)?;
        let physical_block_size = block_size
            .checked_add(IV_SIZE as u32)
            .ok_or_else(|| OramError::InvalidArgument("block size overflow".into()))?;
        let encrypted_header = crypto::encrypt(&key, header_data.unwrap_or(&[]), rng)?;

        let backend = backend_config.setup(
            physical_block_size,
            block_count,
            Some(&encrypted_header),
            None,
            ignore_existing,
        )?;

        let mut storage = Self {
            backend,
            key,
            logical_block_size: block_size,
        };
        if let Some(cb) = initialize.as_deref_mut() {
            for i in 0..block_count {
                let plaintext = cb(i);
                storage.write_block(i, &plaintext, rng)?;
            }
        }
        Ok(storage)
    }

    /// Opens an existing encrypted storage under the supplied key. The
    /// plaintext header is decrypted lazily by [`Self::header_data`], not
    /// eagerly here.
    pub fn open(backend_config: &BackendConfig, key: Key, ignore_lock: bool) -> OramResult<Self> {
        let backend = backend_config.open(ignore_lock)?;
        let logical_block_size = backend
            .block_size()
            .checked_sub(IV_SIZE as u32)
            .ok_or_else(|| {
                OramError::InvalidArgument("physical block smaller than IV".into())
            })?;
        Ok(Self {
            backend,
            key,
            logical_block_size,
        })
    }

    /// The key this handle encrypts and decrypts with.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Logical (plaintext) block size, i.e. physical size minus the IV.
    pub fn block_size(&self) -> u32 {
        self.logical_block_size
    }

    pub fn block_count(&self) -> u32 {
        self.backend.block_count()
    }

    /// Decrypts and returns the current user header.
    pub fn header_data(&self) -> OramResult<Vec<u8>> {
        crypto::decrypt(&self.key, &self.backend.header_data())
    }

    /// Encrypts `new_header` with a fresh IV and stores it. Plaintext length
    /// must match the current header's plaintext length (enforced by the
    /// backend's own size-preserving `update_header_data`).
    pub fn update_header_data<R: RngCore + CryptoRng>(
        &mut self,
        new_header: &[u8],
        rng: &mut R,
    ) -> OramResult<()> {
        let ciphertext = crypto::encrypt(&self.key, new_header, rng)?;
        self.backend.update_header_data(&ciphertext)
    }

    /// Reads and decrypts block `i`.
    pub fn read_block(&mut self, i: u32) -> OramResult<Vec<u8>> {
        let ciphertext = self.backend.read_block(i)?;
        crypto::decrypt(&self.key, &ciphertext)
    }

    /// Encrypts `plaintext` with a fresh IV and writes it to slot `i`. Two
    /// successive writes of the same plaintext to the same slot always
    /// produce distinct ciphertext.
    pub fn write_block<R: RngCore + CryptoRng>(
        &mut self,
        i: u32,
        plaintext: &[u8],
        rng: &mut R,
    ) -> OramResult<()> {
        check_len(plaintext, self.logical_block_size)?;
        let ciphertext = crypto::encrypt(&self.key, plaintext, rng)?;
        self.backend.write_block(i, &ciphertext)
    }

    /// An independent handle onto the same physical backend, sharing the
    /// key, that does not hold the write lock.
    pub fn clone_device(&self) -> OramResult<Self> {
        Ok(Self {
            backend: self.backend.clone_device()?,
            key: self.key.clone(),
            logical_block_size: self.logical_block_size,
        })
    }

    pub fn close(self) -> OramResult<()> {
        self.backend.close()
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
    fn physical_block_size_is_logical_plus_iv() {
        let mut rng = StdRng::seed_from_u64(1);
        let storage = EncryptedBlockStorage::setup(
            &ram_config("enc-size"),
            16,
            4,
            32,
            None,
            None,
            false,
            &mut rng,
        )
        .unwrap();
        assert_eq!(storage.block_size(), 16);
        storage.close().unwrap();
    }

    #[test]
    fn same_plaintext_written_twice_differs_on_disk() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut storage = EncryptedBlockStorage::setup(
            &ram_config("enc-distinct"),
            16,
            1,
            32,
            None,
            None,
            false,
            &mut rng,
        )
        .unwrap();
        let pt = vec![7u8; 16];
        storage.write_block(0, &pt, &mut rng).unwrap();
        let first = storage.backend.read_block(0).unwrap();
        storage.write_block(0, &pt, &mut rng).unwrap();
        let second = storage.backend.read_block(0).unwrap();
        assert_ne!(first, second);
        storage.close().unwrap();
    }

    #[test]
    fn round_trips_across_close_and_reopen() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut init = |i: u32| vec![i as u8; 8];
        let storage = EncryptedBlockStorage::setup(
            &ram_config("enc-roundtrip"),
            8,
            4,
            32,
            Some(b"hdr"),
            Some(&mut init),
            false,
            &mut rng,
        )
        .unwrap();
        let key = storage.key().clone();
        storage.close().unwrap();

        let mut reopened =
            EncryptedBlockStorage::open(&ram_config("enc-roundtrip"), key, false).unwrap();
        assert_eq!(reopened.header_data().unwrap(), b"hdr".to_vec());
        for i in 0..4u32 {
            assert_eq!(reopened.read_block(i).unwrap(), vec![i as u8; 8]);
        }
        reopened.close().unwrap();
    }
}
