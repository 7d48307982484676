//! Filesystem blob backend.
//!
//! Blobs live as flat files under a configured root directory. Handles
//! returned by `open` read straight from the file, which is already
//! seekable, so no spooling is needed.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use super::{
    spool_verified, BlobBackend, BlobReader, BlobStat, ChallengeResponse, ContentChallenge,
};
use crate::error::StoreError;

pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        // Blob names are flat hex identifiers; anything path-like is
        // refused rather than resolved.
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(StoreError::bad_request(format!("invalid blob name {name:?}")));
        }
        Ok(self.root.join(name))
    }

    async fn store(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        hash: &str,
    ) -> Result<(), StoreError> {
        let path = self.blob_path(name)?;
        let spool = spool_verified(reader, hash).await?;
        tokio::fs::copy(spool.path(), &path).await?;
        Ok(())
    }

    fn map_not_found(err: std::io::Error, name: &str) -> StoreError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::not_found(format!("blob {name}"))
        } else {
            err.into()
        }
    }
}

#[async_trait]
impl BlobBackend for LocalFsBackend {
    async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        _size: u64,
        hash: &str,
        _proof: Option<&ChallengeResponse>,
    ) -> Result<Option<ContentChallenge>, StoreError> {
        self.store(reader, name, hash).await?;
        Ok(None)
    }

    async fn put_unchallenged(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        _size: u64,
        hash: &str,
    ) -> Result<(), StoreError> {
        self.store(reader, name, hash).await
    }

    async fn open(&self, name: &str) -> Result<(BlobReader, u64), StoreError> {
        let path = self.blob_path(name)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| Self::map_not_found(err, name))?;
        let size = file
            .metadata()
            .await
            .map_err(StoreError::from)?
            .len();
        Ok((BlobReader::from_file(file), size))
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        let path = self.blob_path(name)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|err| Self::map_not_found(err, name))
    }

    async fn stat_all(&self) -> Result<Vec<BlobStat>, StoreError> {
        let mut stats = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            stats.push(BlobStat {
                name,
                size: metadata.len(),
            });
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stats)
    }
}
