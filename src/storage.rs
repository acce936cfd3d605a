//! Durable storage for harvested build logs.

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::info;

use crate::backend::BackendFuture;

/// Errors raised while persisting blobs.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StorageError {
    /// Raised when a key would escape its bucket.
    #[error("invalid storage key {key}")]
    InvalidKey {
        /// Offending key.
        key: String,
    },
    /// Raised when the write fails.
    #[error("failed to store {bucket}/{key}: {message}")]
    Write {
        /// Target bucket.
        bucket: String,
        /// Target key.
        key: String,
        /// I/O error description.
        message: String,
    },
}

/// Object storage addressed by bucket and key.
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` at `bucket`/`key`. When `synchronous` is set the call
    /// returns only once the data is durable.
    fn upload<'a>(
        &'a self,
        bytes: &'a [u8],
        bucket: &'a str,
        key: &'a str,
        synchronous: bool,
    ) -> BackendFuture<'a, (), StorageError>;
}

/// Blob store that maps buckets to sub-directories of a local root.
#[derive(Clone, Debug)]
pub struct DirectoryBlobStore {
    root: Utf8PathBuf,
}

impl DirectoryBlobStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn write(&self, bytes: &[u8], bucket: &str, key: &str, synchronous: bool) -> Result<(), StorageError> {
        let relative = Utf8Path::new(bucket).join(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|part| matches!(part, camino::Utf8Component::ParentDir))
        {
            return Err(StorageError::InvalidKey {
                key: relative.into_string(),
            });
        }
        let write_error = |err: std::io::Error| StorageError::Write {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            message: err.to_string(),
        };

        Dir::create_ambient_dir_all(&self.root, ambient_authority()).map_err(write_error)?;
        let dir = Dir::open_ambient_dir(&self.root, ambient_authority()).map_err(write_error)?;
        if let Some(parent) = relative.parent().filter(|parent| !parent.as_str().is_empty()) {
            dir.create_dir_all(parent).map_err(write_error)?;
        }
        let mut file = dir.create(&relative).map_err(write_error)?;
        file.write_all(bytes).map_err(write_error)?;
        if synchronous {
            file.sync_all().map_err(write_error)?;
        }
        info!(bucket, key, bytes = bytes.len(), "stored blob");
        Ok(())
    }
}

impl BlobStore for DirectoryBlobStore {
    fn upload<'a>(
        &'a self,
        bytes: &'a [u8],
        bucket: &'a str,
        key: &'a str,
        synchronous: bool,
    ) -> BackendFuture<'a, (), StorageError> {
        Box::pin(async move { self.write(bytes, bucket, key, synchronous) })
    }
}
