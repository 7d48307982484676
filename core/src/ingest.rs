//! Archive ingest: hash and upload an archive, then record metadata.
//!
//! The blob write fully completes before the metadata insert begins, so
//! a failed insert leaves at worst an unreferenced, content-addressed
//! blob. A `DuplicateUpload` deliberately leaves the blob in place: a
//! future entity may reference the same bytes, and unreferenced blobs
//! are collected out of band.

use tokio::io::AsyncRead;

use crate::blob::{new_blob_name, spool_reader};
use crate::bundle::BundleData;
use crate::charm::CharmData;
use crate::error::StoreError;
use crate::reference::EntityRef;
use crate::store::EntityStore;

impl EntityStore {
    /// Streams an archive into the blob store, returning the generated
    /// blob name, the hex SHA-384 of the content, and its size.
    pub async fn put_archive(
        &self,
        archive: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(String, String, u64), StoreError> {
        let spool = spool_reader(archive).await?;
        let blob_name = new_blob_name();
        let hash = spool.hash.clone();
        let size = spool.size;

        let mut content = spool.reopen()?;
        self.blob_store()
            .put_unchallenged(&mut content, &blob_name, size, &hash)
            .await?;
        Ok((blob_name, hash, size))
    }

    /// Uploads a charm archive and records its entity in one step.
    pub async fn add_charm_with_archive(
        &self,
        url: &EntityRef,
        charm: &CharmData,
        archive: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), StoreError> {
        let (blob_name, hash, size) = self.put_archive(archive).await?;
        self.add_charm(url, charm, &blob_name, &hash, size).await
    }

    /// Uploads a bundle archive and records its entity in one step.
    pub async fn add_bundle_with_archive(
        &self,
        url: &EntityRef,
        data: &BundleData,
        readme: &str,
        archive: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), StoreError> {
        let (blob_name, hash, size) = self.put_archive(archive).await?;
        self.add_bundle(url, data, readme, &blob_name, &hash, size)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::blob::memory::MemoryBackend;
    use crate::blob::BlobStore;
    use crate::charm::{CharmData, CharmMeta};
    use crate::db::memory::MemoryEntityRepository;
    use crate::hash::sha384_hex;
    use tokio::io::AsyncReadExt;

    fn store() -> EntityStore {
        EntityStore::new(
            Arc::new(MemoryEntityRepository::new()),
            BlobStore::new(Arc::new(MemoryBackend::new())),
        )
    }

    fn charm(name: &str) -> CharmData {
        CharmData {
            meta: CharmMeta {
                name: name.into(),
                ..Default::default()
            },
            config: None,
            actions: None,
        }
    }

    #[tokio::test]
    async fn ingest_round_trips_bytes_and_hash() {
        let store = store();
        let url = EntityRef::parse("cs:precise/wordpress-0").unwrap();
        let content = b"zip bytes of the wordpress charm".to_vec();

        let mut reader: &[u8] = &content;
        store
            .add_charm_with_archive(&url, &charm("wordpress"), &mut reader)
            .await
            .unwrap();

        let entity = store.resolve(&url).await.unwrap();
        assert_eq!(entity.blob_hash, sha384_hex(&content));
        assert_eq!(entity.size, content.len() as i64);
        assert_eq!(entity.blob_name.len(), 24);

        let (mut blob, size) = store.open_blob(&url).await.unwrap();
        assert_eq!(size, content.len() as u64);
        let mut bytes = Vec::new();
        blob.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, content);
    }

    #[tokio::test]
    async fn duplicate_ingest_keeps_the_blob() {
        let store = store();
        let url = EntityRef::parse("cs:precise/wordpress-0").unwrap();
        let content = b"same archive twice".to_vec();

        let mut reader: &[u8] = &content;
        store
            .add_charm_with_archive(&url, &charm("wordpress"), &mut reader)
            .await
            .unwrap();

        let mut reader: &[u8] = &content;
        let err = store
            .add_charm_with_archive(&url, &charm("wordpress"), &mut reader)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUpload));

        // The second upload's bytes deduplicated onto the existing
        // stream, and the first entity still opens fine.
        assert_eq!(store.blob_store().stat_all().await.unwrap().len(), 1);
        assert!(store.open_blob(&url).await.is_ok());
    }

    #[tokio::test]
    async fn same_bytes_under_two_urls_share_a_stream() {
        let store = store();
        let content = b"shared bundle payload".to_vec();

        for url in ["cs:precise/wordpress-0", "cs:precise/wordpress-1"] {
            let url = EntityRef::parse(url).unwrap();
            let mut reader: &[u8] = &content;
            store
                .add_charm_with_archive(&url, &charm("wordpress"), &mut reader)
                .await
                .unwrap();
        }

        assert_eq!(store.blob_store().stat_all().await.unwrap().len(), 1);
        for url in ["cs:precise/wordpress-0", "cs:precise/wordpress-1"] {
            let url = EntityRef::parse(url).unwrap();
            let (mut blob, _) = store.open_blob(&url).await.unwrap();
            assert_eq!(blob.read_to_end_vec().await.unwrap(), content);
        }
    }
}
