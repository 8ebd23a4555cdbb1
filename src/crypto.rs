// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Fresh-IV AES-CTR stream encryption.
//!
//! Ports `pyoram.crypto.aesctr.AESCTR`: `KeyGen` draws a fresh key of the
//! requested size, `Enc` samples a fresh 16-byte IV and prepends it to the
//! ciphertext, `Dec` is the inverse. Two encryptions of the same plaintext
//! differ in their IV prefix with overwhelming probability; this is the
//! crate's only confidentiality guarantee (see `spec.md` Non-goals — no
//! authentication beyond CTR+length).

use crate::error::{OramError, OramResult};
use aes::cipher::{KeyIvInit, StreamCipher};
use rand::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes192Ctr = ctr::Ctr128BE<aes::Aes192>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Size in bytes of the IV prepended to every ciphertext.
pub const IV_SIZE: usize = 16;

/// The AES key sizes this crate accepts, in bytes.
pub const KEY_SIZES: [usize; 3] = [16, 24, 32];

/// A symmetric key, zeroized on drop so it never lingers in memory (or a
/// core dump) after the handle holding it is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key(Vec<u8>);

impl Key {
    /// Wraps raw key bytes. `bytes.len()` must be one of [`KEY_SIZES`].
    pub fn from_bytes(bytes: Vec<u8>) -> OramResult<Self> {
        if !KEY_SIZES.contains(&bytes.len()) {
            return Err(OramError::InvalidArgument(format!(
                "key size must be one of {KEY_SIZES:?} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Generates a fresh random key of `size_bytes` (must be 16, 24, or 32).
    pub fn generate<R: RngCore + CryptoRng>(size_bytes: usize, rng: &mut R) -> OramResult<Self> {
        if !KEY_SIZES.contains(&size_bytes) {
            return Err(OramError::InvalidArgument(format!(
                "key size must be one of {KEY_SIZES:?} bytes, got {size_bytes}"
            )));
        }
        let mut bytes = vec![0u8; size_bytes];
        rng.fill_bytes(&mut bytes);
        Ok(Self(bytes))
    }

    /// Borrows the raw key bytes. Never log or persist the result.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypts `plaintext` under `key` with a freshly sampled IV, returning
/// `IV || ciphertext`. Ciphertext length is always `plaintext.len() + 16`.
pub fn encrypt<R: RngCore + CryptoRng>(
    key: &Key,
    plaintext: &[u8],
    rng: &mut R,
) -> OramResult<Vec<u8>> {
    let mut iv = [0u8; IV_SIZE];
    rng.fill_bytes(&mut iv);

    let mut out = Vec::with_capacity(IV_SIZE + plaintext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(plaintext);
    let body = &mut out[IV_SIZE..];

    match key.as_bytes().len() {
        16 => Aes128Ctr::new_from_slices(key.as_bytes(), &iv)
            .map_err(|e| OramError::InvalidArgument(e.to_string()))?
            .apply_keystream(body),
        24 => Aes192Ctr::new_from_slices(key.as_bytes(), &iv)
            .map_err(|e| OramError::InvalidArgument(e.to_string()))?
            .apply_keystream(body),
        32 => Aes256Ctr::new_from_slices(key.as_bytes(), &iv)
            .map_err(|e| OramError::InvalidArgument(e.to_string()))?
            .apply_keystream(body),
        other => {
            return Err(OramError::InvalidArgument(format!(
                "key size must be one of {KEY_SIZES:?} bytes, got {other}"
            )))
        }
    }
    Ok(out)
}

/// Decrypts `iv_and_ciphertext` (as produced by [`encrypt`]) under `key`.
pub fn decrypt(key: &Key, iv_and_ciphertext: &[u8]) -> OramResult<Vec<u8>> {
    if iv_and_ciphertext.len() < IV_SIZE {
        return Err(OramError::InvalidArgument(
            "ciphertext shorter than IV".into(),
        ));
    }
    let (iv, ciphertext) = iv_and_ciphertext.split_at(IV_SIZE);
    let mut out = ciphertext.to_vec();

    match key.as_bytes().len() {
        16 => Aes128Ctr::new_from_slices(key.as_bytes(), iv)
            .map_err(|e| OramError::InvalidArgument(e.to_string()))?
            .apply_keystream(&mut out),
        24 => Aes192Ctr::new_from_slices(key.as_bytes(), iv)
            .map_err(|e| OramError::InvalidArgument(e.to_string()))?
            .apply_keystream(&mut out),
        32 => Aes256Ctr::new_from_slices(key.as_bytes(), iv)
            .map_err(|e| OramError::InvalidArgument(e.to_string()))?
            .apply_keystream(&mut out),
        other => {
            return Err(OramError::InvalidArgument(format!(
                "key size must be one of {KEY_SIZES:?} bytes, got {other}"
            )))
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn round_trips_for_all_key_sizes() {
        let mut rng = StdRng::seed_from_u64(7);
        for &size in &KEY_SIZES {
            let key = Key::generate(size, &mut rng).unwrap();
            for plaintext in [&b""[..], b"x", b"a longer plaintext message here"] {
                let ct = encrypt(&key, plaintext, &mut rng).unwrap();
                assert_eq!(ct.len(), plaintext.len() + IV_SIZE);
                let pt = decrypt(&key, &ct).unwrap();
                assert_eq!(pt, plaintext);
            }
        }
    }

    #[test]
    fn successive_encryptions_differ_in_iv_prefix() {
        let mut rng = StdRng::seed_from_u64(11);
        let key = Key::generate(32, &mut rng).unwrap();
        let plaintext = b"same plaintext every time";
        let mut distinct = 0;
        let mut prev: Option<Vec<u8>> = None;
        for _ in 0..50 {
            let ct = encrypt(&key, plaintext, &mut rng).unwrap();
            if let Some(p) = &prev {
                if p[..IV_SIZE] != ct[..IV_SIZE] {
                    distinct += 1;
                }
            }
            prev = Some(ct);
        }
        assert_eq!(distinct, 49);
    }

    #[test]
    fn rejects_bad_key_size() {
        assert!(Key::from_bytes(vec![0u8; 10]).is_err());
    }
}
