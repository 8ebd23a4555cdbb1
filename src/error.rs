// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The crate's single error type.

use std::num::TryFromIntError;
use thiserror::Error;

/// Errors produced anywhere in the storage, encryption, or ORAM layers.
///
/// A handle that has returned an error other than [`OramError::IoTransient`]
/// should be discarded; the manager does not attempt to repair its in-memory
/// state after a failed access.
#[derive(Error, Debug)]
pub enum OramError {
    /// `open` was called on a storage location that does not exist.
    #[error("storage location not found: {0}")]
    NotFound(String),

    /// `setup` was called on a storage location that already exists, without
    /// `ignore_existing`.
    #[error("storage location already exists: {0}")]
    AlreadyExists(String),

    /// `open` found the storage's advisory lock set, without `ignore_lock`.
    #[error("storage is locked by another writer: {0}")]
    Locked(String),

    /// A size, index, or argument was structurally invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A caller-supplied stash or position map did not match the digest
    /// stamped in the storage header at the previous close.
    #[error("stash/position-map digest mismatch: {0}")]
    DigestMismatch(String),

    /// A transient error surfaced unwrapped from a backend (disk or network).
    #[error("transient I/O error: {0}")]
    IoTransient(#[from] std::io::Error),

    /// `setup` failed after partially creating storage; the caller is
    /// guaranteed no artifact was left behind.
    #[error("setup failed: {0}")]
    SetupFailed(String),

    /// An index or length did not fit the target integer type.
    #[error("integer conversion error: {0}")]
    TryFromInt(#[from] TryFromIntError),
}

/// A `Result` specialized to [`OramError`].
pub type OramResult<T> = Result<T, OramError>;
