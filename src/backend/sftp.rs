// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A remote-file block-storage backend over SFTP (feature `sftp`).
//!
//! Same on-wire layout as [`super::file::FileBlockStorage`]
//! (`pyoram.storage.block_storage_sftp.BlockStorageSFTP` is a thin
//! seek/read/write shim over the same file format as the local backend), but
//! every I/O call crosses the network via `ssh2`.

use super::{check_block_len, check_index, validate_shape, BlockStorage, StorageHeader};
use crate::error::{OramError, OramResult};
use ssh2::Session;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

fn io_err<E: std::fmt::Display>(e: E) -> OramError {
    OramError::IoTransient(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

/// Connection parameters for an SFTP-backed storage.
#[derive(Clone)]
pub struct SftpEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
}

impl SftpEndpoint {
    fn connect(&self) -> OramResult<Session> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).map_err(io_err)?;
        let mut session = Session::new().map_err(io_err)?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(io_err)?;
        match &self.password {
            Some(password) => session
                .userauth_password(&self.username, password)
                .map_err(io_err)?,
            None => session.userauth_agent(&self.username).map_err(io_err)?,
        }
        if !session.authenticated() {
            return Err(OramError::SetupFailed("sftp authentication failed".into()));
        }
        Ok(session)
    }
}

/// A block-storage backend over a single remote file accessed via SFTP.
pub struct SftpBlockStorage {
    session: Session,
    remote_path: String,
    header: StorageHeader,
    user_header: Vec<u8>,
    data_offset: u64,
    holds_lock: bool,
    endpoint: Arc<Mutex<SftpEndpoint>>,
}

impl SftpBlockStorage {
    fn sftp(&self) -> OramResult<ssh2::Sftp> {
        self.session.sftp().map_err(io_err)
    }

    fn block_offset(&self, i: u32) -> u64 {
        self.data_offset + i as u64 * self.header.block_size as u64
    }

    /// Creates a new remote file at `remote_path` over `endpoint`.
    pub fn setup(
        endpoint: SftpEndpoint,
        remote_path: impl Into<String>,
        block_size: u32,
        block_count: u32,
        header_data: Option<&[u8]>,
        mut initialize: Option<&mut dyn FnMut(u32) -> Vec<u8>>,
        ignore_existing: bool,
    ) -> OramResult<Self> {
        validate_shape(block_size, block_count)?;
        let remote_path = remote_path.into();
        let session = endpoint.connect()?;
        let sftp = session.sftp().map_err(io_err)?;

        if !ignore_existing && sftp.stat(remote_path.as_ref()).is_ok() {
            return Err(OramError::AlreadyExists(remote_path));
        }

        let result = (|| -> OramResult<()> {
            let mut file = sftp
                .create(remote_path.as_ref())
                .map_err(io_err)?;
            let header_data = header_data.unwrap_or(&[]);
            let header = StorageHeader {
                block_size,
                block_count,
                user_header_len: header_data.len() as u32,
                locked: false,
            };
            file.write_all(&header.to_bytes()).map_err(io_err)?;
            file.write_all(header_data).map_err(io_err)?;

            let zeros = vec![0u8; block_size as usize];
            for i in 0..block_count {
                let block = match initialize.as_deref_mut() {
                    Some(cb) => cb(i),
                    None => zeros.clone(),
                };
                check_block_len(&block, block_size)?;
                file.write_all(&block).map_err(io_err)?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            let _ = sftp.unlink(remote_path.as_ref());
            return Err(OramError::SetupFailed(e.to_string()));
        }

        Self::open(endpoint, remote_path, false)
    }

    /// Opens an existing remote storage over `endpoint`.
    pub fn open(
        endpoint: SftpEndpoint,
        remote_path: impl Into<String>,
        ignore_lock: bool,
    ) -> OramResult<Self> {
        let remote_path = remote_path.into();
        let session = endpoint.connect()?;
        let sftp = session.sftp().map_err(io_err)?;

        if sftp.stat(remote_path.as_ref()).is_err() {
            return Err(OramError::NotFound(remote_path));
        }
        let mut file = sftp.open(remote_path.as_ref()).map_err(io_err)?;

        let mut prefix = [0u8; super::STORAGE_HEADER_SIZE];
        file.read_exact(&mut prefix).map_err(io_err)?;
        let header = StorageHeader::from_bytes(&prefix)?;

        if header.locked && !ignore_lock {
            return Err(OramError::Locked(remote_path));
        }

        let mut user_header = vec![0u8; header.user_header_len as usize];
        file.read_exact(&mut user_header).map_err(io_err)?;

        if !ignore_lock {
            let locked_header = StorageHeader {
                locked: true,
                ..header
            };
            let mut file = sftp
                .open_mode(
                    remote_path.as_ref(),
                    ssh2::OpenFlags::WRITE,
                    0o644,
                    ssh2::OpenType::File,
                )
                .map_err(io_err)?;
            file.seek(SeekFrom::Start(0)).map_err(io_err)?;
            file.write_all(&locked_header.to_bytes()).map_err(io_err)?;
        }

        Ok(Self {
            data_offset: super::STORAGE_HEADER_SIZE as u64 + header.user_header_len as u64,
            session,
            remote_path,
            header,
            user_header,
            holds_lock: !ignore_lock,
            endpoint: Arc::new(Mutex::new(endpoint)),
        })
    }

    fn open_rw(&self) -> OramResult<ssh2::File> {
        self.sftp()?
            .open_mode(
                self.remote_path.as_ref(),
                ssh2::OpenFlags::READ | ssh2::OpenFlags::WRITE,
                0o644,
                ssh2::OpenType::File,
            )
            .map_err(io_err)
    }
}

impl BlockStorage for SftpBlockStorage {
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
        let mut file = self.open_rw()?;
        file.seek(SeekFrom::Start(self.block_offset(i)))
            .map_err(io_err)?;
        let mut buf = vec![0u8; self.header.block_size as usize];
        file.read_exact(&mut buf).map_err(io_err)?;
        Ok(buf)
    }

    fn write_block(&mut self, i: u32, data: &[u8]) -> OramResult<()> {
        check_index(i, self.header.block_count)?;
        check_block_len(data, self.header.block_size)?;
        let mut file = self.open_rw()?;
        file.seek(SeekFrom::Start(self.block_offset(i)))
            .map_err(io_err)?;
        file.write_all(data).map_err(io_err)?;
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
        let mut file = self.open_rw()?;
        file.seek(SeekFrom::Start(super::STORAGE_HEADER_SIZE as u64))
            .map_err(io_err)?;
        file.write_all(&self.user_header).map_err(io_err)?;
        Ok(())
    }

    fn clone_device(&self) -> OramResult<Box<dyn BlockStorage>> {
        let endpoint = self.endpoint.lock().unwrap().clone();
        Ok(Box::new(Self::open(
            endpoint,
            self.remote_path.clone(),
            true,
        )?))
    }

    fn close(self: Box<Self>) -> OramResult<()> {
        if self.holds_lock {
            let unlocked = StorageHeader {
                locked: false,
                ..self.header
            };
            let mut file = self.open_rw()?;
            file.seek(SeekFrom::Start(0)).map_err(io_err)?;
            file.write_all(&unlocked.to_bytes()).map_err(io_err)?;
        }
        Ok(())
    }
}
