// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An S3-style object-store block-storage backend (feature `s3`).
//!
//! One object per block, named `<prefix>/b<i>`, and one index object named
//! `<prefix>/PyORAMBlockStorageS3_index.txt` holding the same
//! [`super::StorageHeader`] prefix plus the opaque user header — matching
//! `spec.md` §6 and `pyoram.storage.block_storage_s3.BlockStorageS3` (which
//! lays the index object out identically). `aws-sdk-s3` is async-only; this
//! backend keeps its own single-threaded Tokio runtime so the
//! [`BlockStorage`] trait itself stays synchronous, like every other
//! backend in this crate.

use super::{check_block_len, check_index, validate_shape, BlockStorage, StorageHeader};
use crate::error::{OramError, OramResult};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::io;

fn sdk_err<E: std::fmt::Display>(e: E) -> OramError {
    OramError::IoTransient(io::Error::new(io::ErrorKind::Other, e.to_string()))
}

/// A block-storage backend over objects in an S3-compatible bucket.
pub struct S3BlockStorage {
    runtime: tokio::runtime::Runtime,
    client: Client,
    bucket: String,
    prefix: String,
    header: StorageHeader,
    user_header: Vec<u8>,
    holds_lock: bool,
}

impl S3BlockStorage {
    fn index_key(prefix: &str) -> String {
        format!("{prefix}/PyORAMBlockStorageS3_index.txt")
    }

    fn block_key(prefix: &str, i: u32) -> String {
        format!("{prefix}/b{i}")
    }

    fn build_client(runtime: &tokio::runtime::Runtime) -> Client {
        let config = runtime.block_on(aws_config::load_from_env());
        Client::new(&config)
    }

    fn get_object(&self, key: &str) -> OramResult<Vec<u8>> {
        let client = &self.client;
        let bucket = &self.bucket;
        self.runtime.block_on(async {
            let resp = client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(sdk_err)?;
            let bytes = resp.body.collect().await.map_err(sdk_err)?;
            Ok(bytes.into_bytes().to_vec())
        })
    }

    fn put_object(&self, key: &str, body: Vec<u8>) -> OramResult<()> {
        let client = &self.client;
        let bucket = &self.bucket;
        self.runtime.block_on(async {
            client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(sdk_err)?;
            Ok(())
        })
    }

    fn delete_object(&self, key: &str) {
        let client = &self.client;
        let bucket = &self.bucket;
        let _ = self.runtime.block_on(async {
            client.delete_object().bucket(bucket).key(key).send().await
        });
    }

    fn object_exists(&self, key: &str) -> bool {
        let client = &self.client;
        let bucket = &self.bucket;
        self.runtime
            .block_on(async { client.head_object().bucket(bucket).key(key).send().await })
            .is_ok()
    }

    /// Creates a new object-store storage under `bucket`/`prefix`.
    pub fn setup(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        block_size: u32,
        block_count: u32,
        header_data: Option<&[u8]>,
        mut initialize: Option<&mut dyn FnMut(u32) -> Vec<u8>>,
        ignore_existing: bool,
    ) -> OramResult<Self> {
        validate_shape(block_size, block_count)?;
        let bucket = bucket.into();
        let prefix = prefix.into();
        let runtime = tokio::runtime::Runtime::new().map_err(OramError::IoTransient)?;
        let client = Self::build_client(&runtime);

        let index_key = Self::index_key(&prefix);
        let storage = Self {
            runtime,
            client,
            bucket,
            prefix: prefix.clone(),
            header: StorageHeader {
                block_size,
                block_count,
                user_header_len: 0,
                locked: false,
            },
            user_header: Vec::new(),
            holds_lock: false,
        };

        if !ignore_existing && storage.object_exists(&index_key) {
            return Err(OramError::AlreadyExists(format!(
                "{}/{index_key}",
                storage.bucket
            )));
        }

        let result = (|| -> OramResult<()> {
            let header_data = header_data.unwrap_or(&[]);
            let header = StorageHeader {
                block_size,
                block_count,
                user_header_len: header_data.len() as u32,
                locked: false,
            };
            let mut index_bytes = header.to_bytes().to_vec();
            index_bytes.extend_from_slice(header_data);
            storage.put_object(&index_key, index_bytes)?;

            let zeros = vec![0u8; block_size as usize];
            for i in 0..block_count {
                let block = match initialize.as_deref_mut() {
                    Some(cb) => cb(i),
                    None => zeros.clone(),
                };
                check_block_len(&block, block_size)?;
                storage.put_object(&Self::block_key(&prefix, i), block)?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            storage.delete_object(&index_key);
            for i in 0..block_count {
                storage.delete_object(&Self::block_key(&prefix, i));
            }
            return Err(OramError::SetupFailed(e.to_string()));
        }

        Self::open(storage.bucket, prefix, false)
    }

    /// Opens an existing object-store storage.
    pub fn open(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        ignore_lock: bool,
    ) -> OramResult<Self> {
        let bucket = bucket.into();
        let prefix = prefix.into();
        let runtime = tokio::runtime::Runtime::new().map_err(OramError::IoTransient)?;
        let client = Self::build_client(&runtime);
        let index_key = Self::index_key(&prefix);

        let mut storage = Self {
            runtime,
            client,
            bucket: bucket.clone(),
            prefix: prefix.clone(),
            header: StorageHeader {
                block_size: 0,
                block_count: 0,
                user_header_len: 0,
                locked: false,
            },
            user_header: Vec::new(),
            holds_lock: false,
        };

        if !storage.object_exists(&index_key) {
            return Err(OramError::NotFound(format!("{bucket}/{index_key}")));
        }
        let index_bytes = storage.get_object(&index_key)?;
        let header = StorageHeader::from_bytes(&index_bytes)?;
        if header.locked && !ignore_lock {
            return Err(OramError::Locked(format!("{bucket}/{index_key}")));
        }
        let user_header =
            index_bytes[super::STORAGE_HEADER_SIZE..][..header.user_header_len as usize].to_vec();

        storage.header = header;
        storage.user_header = user_header;

        if !ignore_lock {
            let mut locked_bytes = StorageHeader {
                locked: true,
                ..header
            }
            .to_bytes()
            .to_vec();
            locked_bytes.extend_from_slice(&storage.user_header);
            storage.put_object(&index_key, locked_bytes)?;
            storage.header.locked = true;
        }
        storage.holds_lock = !ignore_lock;
        Ok(storage)
    }
}

impl BlockStorage for S3BlockStorage {
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
        check_index(i, self.header.block_count)?;
        self.get_object(&Self::block_key(&self.prefix, i))
    }

    fn write_block(&mut self, i: u32, data: &[u8]) -> OramResult<()> {
        check_index(i, self.header.block_count)?;
        check_block_len(data, self.header.block_size)?;
        self.put_object(&Self::block_key(&self.prefix, i), data.to_vec())
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
        let mut bytes = self.header.to_bytes().to_vec();
        bytes.extend_from_slice(&self.user_header);
        self.put_object(&Self::index_key(&self.prefix), bytes)
    }

    fn clone_device(&self) -> OramResult<Box<dyn BlockStorage>> {
        Ok(Box::new(Self::open(
            self.bucket.clone(),
            self.prefix.clone(),
            true,
        )?))
    }

    fn close(mut self: Box<Self>) -> OramResult<()> {
        if self.holds_lock {
            let mut bytes = StorageHeader {
                locked: false,
                ..self.header
            }
            .to_bytes()
            .to_vec();
            bytes.extend_from_slice(&self.user_header);
            self.put_object(&Self::index_key(&self.prefix), bytes)?;
        }
        Ok(())
    }
}
