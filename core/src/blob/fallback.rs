//! Composite backend used while migrating between storage providers.
//!
//! The first backend is the read/write store; the rest are read-only
//! legacy stores that are drained by background copying and then dropped
//! from configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tracing::debug;

use super::{BlobBackend, BlobReader, BlobStat, ChallengeResponse, ContentChallenge};
use crate::error::StoreError;

pub struct FallbackStore {
    backends: Vec<Arc<dyn BlobBackend>>,
}

impl FallbackStore {
    /// The first backend is the primary; at least one is required.
    pub fn new(backends: Vec<Arc<dyn BlobBackend>>) -> Result<Self, StoreError> {
        if backends.is_empty() {
            return Err(StoreError::bad_request(
                "fallback store requires at least one backend",
            ));
        }
        Ok(Self { backends })
    }

    fn primary(&self) -> &dyn BlobBackend {
        self.backends[0].as_ref()
    }
}

#[async_trait]
impl BlobBackend for FallbackStore {
    async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        size: u64,
        hash: &str,
        proof: Option<&ChallengeResponse>,
    ) -> Result<Option<ContentChallenge>, StoreError> {
        self.primary().put(reader, name, size, hash, proof).await
    }

    async fn put_unchallenged(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        size: u64,
        hash: &str,
    ) -> Result<(), StoreError> {
        self.primary().put_unchallenged(reader, name, size, hash).await
    }

    async fn open(&self, name: &str) -> Result<(BlobReader, u64), StoreError> {
        for (index, backend) in self.backends.iter().enumerate() {
            match backend.open(name).await {
                Ok(found) => return Ok(found),
                Err(err) if err.is_not_found() => {
                    debug!(name, backend = index, "blob not in backend, trying next");
                }
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::not_found(format!("blob {name}")))
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        self.primary().remove(name).await
    }

    /// Union across every backend so audits still see blobs parked on
    /// legacy stores; the primary's entry wins on name collisions.
    async fn stat_all(&self) -> Result<Vec<BlobStat>, StoreError> {
        let mut merged: BTreeMap<String, BlobStat> = BTreeMap::new();
        for backend in &self.backends {
            for stat in backend.stat_all().await? {
                merged.entry(stat.name.clone()).or_insert(stat);
            }
        }
        Ok(merged.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::memory::MemoryBackend;
    use crate::hash::sha384_hex;

    async fn seed(backend: &MemoryBackend, name: &str, content: &[u8]) {
        let mut reader: &[u8] = content;
        backend
            .put_unchallenged(&mut reader, name, content.len() as u64, &sha384_hex(content))
            .await
            .expect("seed blob");
    }

    #[tokio::test]
    async fn reads_fall_back_in_order() {
        let new_store = Arc::new(MemoryBackend::new());
        let legacy = Arc::new(MemoryBackend::new());
        seed(&legacy, "aaaaaaaaaaaaaaaaaaaaaaaa", b"legacy bytes").await;

        let fallback = FallbackStore::new(vec![new_store.clone(), legacy]).unwrap();

        // A blob only present in the legacy store is still readable.
        let (mut reader, size) = fallback.open("aaaaaaaaaaaaaaaaaaaaaaaa").await.unwrap();
        assert_eq!(size, 12);
        assert_eq!(reader.read_to_end_vec().await.unwrap(), b"legacy bytes");

        assert!(fallback
            .open("ffffffffffffffffffffffff")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn writes_and_removals_stay_on_the_primary() {
        let primary = Arc::new(MemoryBackend::new());
        let legacy = Arc::new(MemoryBackend::new());
        let fallback = FallbackStore::new(vec![primary.clone(), legacy.clone()]).unwrap();

        let content = b"fresh".to_vec();
        let mut reader: &[u8] = &content;
        fallback
            .put(&mut reader, "bbbbbbbbbbbbbbbbbbbbbbbb", 5, &sha384_hex(&content), None)
            .await
            .unwrap();

        assert!(primary.open("bbbbbbbbbbbbbbbbbbbbbbbb").await.is_ok());
        assert!(legacy.open("bbbbbbbbbbbbbbbbbbbbbbbb").await.is_err());

        // Removing a blob that only exists in the legacy store fails:
        // removals never touch read-only backends.
        seed(&legacy, "cccccccccccccccccccccccc", b"parked").await;
        assert!(fallback
            .remove("cccccccccccccccccccccccc")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn stat_all_merges_backends() {
        let primary = Arc::new(MemoryBackend::new());
        let legacy = Arc::new(MemoryBackend::new());
        seed(&primary, "aaaaaaaaaaaaaaaaaaaaaaaa", b"one").await;
        seed(&legacy, "bbbbbbbbbbbbbbbbbbbbbbbb", b"three").await;

        let fallback = FallbackStore::new(vec![primary, legacy]).unwrap();
        let stats = fallback.stat_all().await.unwrap();
        let names: Vec<&str> = stats.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["aaaaaaaaaaaaaaaaaaaaaaaa", "bbbbbbbbbbbbbbbbbbbbbbbb"]);
    }

    #[test]
    fn empty_backend_list_is_rejected() {
        assert!(FallbackStore::new(Vec::new()).is_err());
    }
}
