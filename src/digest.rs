// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Stash and position-map digests, stamped into the Path ORAM header so a
//! reopen can detect a caller-supplied stash or position map that does not
//! match what was stamped at the previous close.
//!
//! The digest algorithm (SHA-1) is not a security boundary here — it is a
//! checksum, chosen because it is cheap and the 20-byte output matches the
//! on-disk header layout in `spec.md` §6. A collision would only let a
//! caller pass a stale stash/position-map pair undetected; it would not
//! break confidentiality or access-pattern privacy, both of which rest on
//! AES-CTR and the Path ORAM protocol itself.

use crate::error::{OramError, OramResult};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// The size in bytes of a stash or position-map digest.
pub const DIGEST_SIZE: usize = 20;

/// Computes the stash digest: SHA-1 over `b"0"` if the stash is empty, else
/// over the concatenation of `(id as big-endian u64, bytes)` for every
/// stash entry in iteration order.
pub fn stash_digest(stash: &BTreeMap<u64, Vec<u8>>) -> OramResult<[u8; DIGEST_SIZE]> {
    let mut hasher = Sha1::new();
    if stash.is_empty() {
        hasher.update(b"0");
    } else {
        for (&id, bytes) in stash.iter() {
            let id: i64 = id.try_into().map_err(|_| {
                OramError::InvalidArgument(format!("stash id {id} does not fit an i64"))
            })?;
            if id < 0 {
                return Err(OramError::InvalidArgument(format!(
                    "negative stash id: {id}"
                )));
            }
            hasher.update(id.to_be_bytes());
            hasher.update(bytes);
        }
    }
    Ok(hasher.finalize().into())
}

/// Computes the position-map digest: SHA-1 over the concatenation of
/// `(P[i] as big-endian u64)` for `i` in `[0, position_map.len())`.
pub fn position_map_digest(position_map: &[u64]) -> OramResult<[u8; DIGEST_SIZE]> {
    let mut hasher = Sha1::new();
    for &leaf in position_map {
        let leaf: i64 = leaf
            .try_into()
            .map_err(|_| OramError::InvalidArgument("position map entry overflowed i64".into()))?;
        if leaf < 0 {
            return Err(OramError::InvalidArgument(
                "negative position map entry".into(),
            ));
        }
        hasher.update(leaf.to_be_bytes());
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stash_digest_is_stable() {
        let empty = BTreeMap::new();
        assert_eq!(stash_digest(&empty).unwrap(), stash_digest(&empty).unwrap());
    }

    #[test]
    fn stash_digest_changes_with_content() {
        let mut a = BTreeMap::new();
        a.insert(1u64, vec![1, 2, 3]);
        let mut b = BTreeMap::new();
        b.insert(1u64, vec![1, 2, 4]);
        assert_ne!(stash_digest(&a).unwrap(), stash_digest(&b).unwrap());
    }

    #[test]
    fn position_map_digest_changes_with_one_entry() {
        let a = vec![1u64, 2, 3];
        let mut b = a.clone();
        b[0] = 99;
        assert_ne!(
            position_map_digest(&a).unwrap(),
            position_map_digest(&b).unwrap()
        );
    }
}
