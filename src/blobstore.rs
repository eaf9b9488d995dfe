// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Content-addressed blob store for raw MIME message bodies (C1).
//!
//! Keys are lowercase hex SHA-256 of the *uncompressed* payload. Grounded on
//! `inbox/util/blockstore.py`: bodies may be transparently Zstandard-framed,
//! detected by the frame magic `0xFD2FB528` (little-endian) at the first
//! four bytes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::warn;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// `0xFD2FB528` in little-endian byte order, per the Zstandard frame format.
const ZSTD_MAGIC_PREFIX: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zstd error: {0}")]
    Zstd(String),
    #[error("stored data does not hash to the requested key")]
    HashMismatch,
}

/// Computes the lowercase hex SHA-256 key for a raw payload.
pub fn content_key(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn is_zstd_frame(data: &[u8]) -> bool {
    data.len() >= 4 && data[0..4] == ZSTD_MAGIC_PREFIX
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Idempotent; a zero-length input is a no-op (logged, not an error),
    /// matching `save_to_blockstore`'s explicit "Not saving 0-length data
    /// blob" warning.
    async fn save(&self, key: &str, data: &[u8]) -> Result<(), BlobStoreError>;

    /// Returns `None` on miss; the caller is expected to re-fetch from the
    /// remote provider and `save` again.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError>;

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;

    async fn delete_many(&self, keys: &[String]) -> Result<(), BlobStoreError> {
        for key in keys {
            // Best-effort: one missing/unreadable key must not abort the rest.
            if let Err(err) = self.delete(key).await {
                warn!("blobstore: failed to delete {key}: {err}");
            }
        }
        Ok(())
    }
}

/// Filesystem-backed blob store, sharded by six individual hex characters
/// into six nested single-character directories (matching
/// `_data_file_directory` exactly — NOT a single six-char-prefix directory).
pub struct FsBlobStore {
    base_dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn shard_dir(&self, key: &str) -> PathBuf {
        let mut dir = self.base_dir.clone();
        for ch in key.chars().take(6) {
            dir.push(ch.to_string());
        }
        dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(key)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn save(&self, key: &str, data: &[u8]) -> Result<(), BlobStoreError> {
        if data.is_empty() {
            warn!("blobstore: not saving 0-length data blob for key {key}");
            return Ok(());
        }
        let dir = self.shard_dir(key);
        let path = self.path_for(key);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
            std::fs::create_dir_all(&dir)?;
            std::fs::write(&path, &data)
        })
        .await
        .map_err(|e| BlobStoreError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError> {
        let path = self.path_for(key);
        let result = tokio::task::spawn_blocking(move || std::fs::read(&path))
            .await
            .map_err(|e| BlobStoreError::Io(std::io::Error::other(e)))?;
        match result {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("blobstore: no data returned for key");
                Ok(None)
            }
            Err(e) => Err(BlobStoreError::Io(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("blobstore: failed to remove {}: {e}", path.display());
                Ok(())
            }
        }
    }
}

/// High-level raw-MIME API, matching `save_raw_mime`/`get_raw_mime`: handles
/// compression and the content-hash round trip on top of a bare `BlobStore`.
pub struct RawMimeStore<S: BlobStore> {
    store: S,
    compress: bool,
}

impl<S: BlobStore> RawMimeStore<S> {
    pub fn new(store: S, compress: bool) -> Self {
        Self { store, compress }
    }

    /// Saves `decompressed` under its own content hash, optionally
    /// Zstandard-compressing it first. If compression would not shrink the
    /// payload, the uncompressed form is kept. Returns the length of the
    /// bytes actually stored.
    pub async fn save_raw_mime(&self, decompressed: &[u8]) -> Result<(String, usize), BlobStoreError> {
        let key = content_key(decompressed);
        let to_store = if self.compress {
            let compressed = zstd::stream::encode_all(decompressed, 0)
                .map_err(|e| BlobStoreError::Zstd(e.to_string()))?;
            debug_assert!(is_zstd_frame(&compressed));
            if compressed.len() > decompressed.len() {
                decompressed.to_vec()
            } else {
                compressed
            }
        } else {
            decompressed.to_vec()
        };
        let len = to_store.len();
        self.store.save(&key, &to_store).await?;
        Ok((key, len))
    }

    /// Fetches and decompresses (if framed) the raw MIME body for `key`.
    /// Verifies the decompressed bytes hash back to `key`.
    pub async fn get_raw_mime(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError> {
        let Some(stored) = self.store.get(key).await? else {
            return Ok(None);
        };
        let decompressed = if is_zstd_frame(&stored) {
            zstd::stream::decode_all(stored.as_slice())
                .map_err(|e| BlobStoreError::Zstd(e.to_string()))?
        } else {
            stored
        };
        if content_key(&decompressed) != key {
            return Err(BlobStoreError::HashMismatch);
        }
        Ok(Some(decompressed))
    }

    pub fn inner(&self) -> &S {
        &self.store
    }
}

/// Exposed for tests and callers that want to confirm the shard layout
/// without depending on `FsBlobStore`'s private fields.
pub fn shard_path(base: &Path, key: &str) -> PathBuf {
    let mut dir = base.to_path_buf();
    for ch in key.chars().take(6) {
        dir.push(ch.to_string());
    }
    dir.join(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_uncompressed() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsBlobStore::new(dir.path());
        let raw = RawMimeStore::new(fs, false);
        let body = b"From: a@b.com\r\nSubject: hi\r\n\r\nhello".to_vec();
        let (key, _len) = raw.save_raw_mime(&body).await.unwrap();
        assert_eq!(key, content_key(&body));
        let fetched = raw.get_raw_mime(&key).await.unwrap().unwrap();
        assert_eq!(fetched, body);
    }

    #[tokio::test]
    async fn round_trip_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsBlobStore::new(dir.path());
        let raw = RawMimeStore::new(fs, true);
        let body = vec![b'a'; 10_000];
        let (key, stored_len) = raw.save_raw_mime(&body).await.unwrap();
        assert!(stored_len < body.len());
        let fetched = raw.get_raw_mime(&key).await.unwrap().unwrap();
        assert_eq!(fetched, body);
    }

    #[tokio::test]
    async fn zero_length_save_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsBlobStore::new(dir.path());
        fs.save("deadbeef", &[]).await.unwrap();
        assert!(fs.get("deadbeef").await.unwrap().is_none());
    }

    #[test]
    fn shards_by_six_nested_single_char_dirs() {
        let base = Path::new("/tmp/blobs");
        let key = "abcdef0123456789";
        let path = shard_path(base, key);
        assert_eq!(
            path,
            Path::new("/tmp/blobs/a/b/c/d/e/f/abcdef0123456789")
        );
    }

    #[tokio::test]
    async fn miss_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsBlobStore::new(dir.path());
        assert!(fs.get("0000").await.unwrap().is_none());
    }
}
