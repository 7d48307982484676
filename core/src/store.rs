use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::blob::{BlobReader, BlobStore};
use crate::bundle::{self, BundleData};
use crate::charm::{interfaces_for_relations, CharmData};
use crate::db::entity_repo::EntityRepositoryRef;
use crate::entity::Entity;
use crate::error::StoreError;
use crate::hash::sha256_hex_of_reader;
use crate::reference::EntityRef;
use crate::search::{document_id, SearchIndex, SEARCH_DOC_TYPE, SEARCH_INDEX};
use crate::stats::Stats;

/// The charm and bundle metadata store.
///
/// Entities are inserted by `add_charm`/`add_bundle` and never mutated
/// afterwards except through extra-info patches and the lazy SHA-256
/// fill. Blob bytes are written before metadata: a failed insert leaves
/// an unreferenced blob for the garbage collector, never a dangling
/// entity.
#[derive(Clone)]
pub struct EntityStore {
    repo: EntityRepositoryRef,
    blobs: BlobStore,
    stats: Arc<Stats>,
}

impl EntityStore {
    pub fn new(repo: EntityRepositoryRef, blobs: BlobStore) -> Self {
        let stats = Arc::new(Stats::new(repo.clone()));
        Self { repo, blobs, stats }
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn require_fully_qualified(url: &EntityRef) -> Result<(), StoreError> {
        if url.is_fully_qualified() {
            Ok(())
        } else {
            Err(StoreError::bad_request(format!(
                "entity URL {url} must include series and revision"
            )))
        }
    }

    /// Records a charm entity for `url` referencing an already stored
    /// blob. Fails with `DuplicateUpload` when the URL exists.
    pub async fn add_charm(
        &self,
        url: &EntityRef,
        charm: &CharmData,
        blob_name: &str,
        blob_hash: &str,
        size: u64,
    ) -> Result<(), StoreError> {
        Self::require_fully_qualified(url)?;
        let entity = Entity {
            url: url.clone(),
            base_url: url.base(),
            blob_name: blob_name.to_owned(),
            blob_hash: blob_hash.to_owned(),
            blob_hash_256: None,
            size: size as i64,
            upload_time: Utc::now(),
            charm_meta: Some(charm.meta.clone()),
            charm_config: charm.config.clone(),
            charm_actions: charm.actions.clone(),
            charm_provided_interfaces: interfaces_for_relations(&charm.meta.provides),
            charm_required_interfaces: interfaces_for_relations(&charm.meta.requires),
            bundle_data: None,
            bundle_readme: None,
            bundle_unit_count: None,
            bundle_machine_count: None,
            bundle_charms: Vec::new(),
            extra_info: Default::default(),
        };
        self.repo.insert(entity).await
    }

    /// Records a bundle entity, deriving the unit and machine counts
    /// from the bundle's placement expressions.
    pub async fn add_bundle(
        &self,
        url: &EntityRef,
        data: &BundleData,
        readme: &str,
        blob_name: &str,
        blob_hash: &str,
        size: u64,
    ) -> Result<(), StoreError> {
        Self::require_fully_qualified(url)?;
        let charms = bundle::bundle_charms(data)?;
        let entity = Entity {
            url: url.clone(),
            base_url: url.base(),
            blob_name: blob_name.to_owned(),
            blob_hash: blob_hash.to_owned(),
            blob_hash_256: None,
            size: size as i64,
            upload_time: Utc::now(),
            charm_meta: None,
            charm_config: None,
            charm_actions: None,
            charm_provided_interfaces: Vec::new(),
            charm_required_interfaces: Vec::new(),
            bundle_data: Some(data.clone()),
            bundle_readme: Some(readme.to_owned()),
            bundle_unit_count: Some(bundle::unit_count(data)),
            bundle_machine_count: Some(bundle::machine_count(data)),
            bundle_charms: charms,
            extra_info: Default::default(),
        };
        self.repo.insert(entity).await
    }

    /// All entities matching a (possibly partial) reference.
    ///
    /// A fully qualified pattern queries the primary key directly;
    /// anything else queries by base URL and filters in memory.
    pub async fn find_entities(&self, pattern: &EntityRef) -> Result<Vec<Entity>, StoreError> {
        if pattern.is_fully_qualified() {
            return Ok(self
                .repo
                .find_by_url(pattern)
                .await?
                .into_iter()
                .collect());
        }
        let mut entities = self.repo.find_by_base_url(&pattern.base()).await?;
        entities.retain(|entity| entity.url.matches(pattern));
        entities.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(entities)
    }

    /// The URLs a partial reference expands to.
    pub async fn expand_url(&self, pattern: &EntityRef) -> Result<Vec<EntityRef>, StoreError> {
        Ok(self
            .find_entities(pattern)
            .await?
            .into_iter()
            .map(|entity| entity.url)
            .collect())
    }

    /// Resolves a reference to a single entity: an exact lookup when
    /// fully qualified, otherwise the highest revision among matches.
    pub async fn resolve(&self, pattern: &EntityRef) -> Result<Entity, StoreError> {
        let mut entities = self.find_entities(pattern).await?;
        entities.sort_by_key(|entity| entity.url.revision);
        entities
            .pop()
            .ok_or_else(|| StoreError::not_found(format!("entity {pattern}")))
    }

    /// The blob name recorded for an entity.
    pub async fn blob_name_for(&self, url: &EntityRef) -> Result<String, StoreError> {
        Ok(self.resolve(url).await?.blob_name)
    }

    /// Opens an entity's archive bytes.
    pub async fn open_blob(&self, url: &EntityRef) -> Result<(BlobReader, u64), StoreError> {
        let blob_name = self.blob_name_for(url).await?;
        self.blobs.open(&blob_name).await
    }

    /// Stores an opaque annotation on an entity. The store never
    /// interprets the value.
    pub async fn update_extra_info(
        &self,
        url: &EntityRef,
        key: &str,
        value: &[u8],
    ) -> Result<(), StoreError> {
        self.repo.update_extra_info(url, key, value).await
    }

    /// The entity's SHA-256 digest, computing and persisting it on
    /// first use. Returns the digest and whether this call computed it.
    pub async fn ensure_blob_hash_256(&self, url: &EntityRef) -> Result<(String, bool), StoreError> {
        let entity = self.resolve(url).await?;
        if let Some(hash) = entity.blob_hash_256 {
            return Ok((hash, false));
        }

        let (mut reader, _size) = self.blobs.open(&entity.blob_name).await?;
        let hash = sha256_hex_of_reader(&mut reader).await?;
        self.repo.set_blob_hash_256(&entity.url, &hash).await?;
        Ok((hash, true))
    }

    /// Pushes every entity to the search index. Individual failures are
    /// logged and skipped; the sweep itself never aborts. Returns the
    /// number of documents exported.
    pub async fn export_to_search_index(
        &self,
        index: &dyn SearchIndex,
    ) -> Result<u64, StoreError> {
        let mut exported = 0u64;
        for entity in self.repo.all_entities().await? {
            let id = document_id(&entity.url.to_string());
            let document = match serde_json::to_value(&entity) {
                Ok(document) => document,
                Err(err) => {
                    warn!(url = %entity.url, error = %err, "cannot serialize entity for search");
                    continue;
                }
            };
            match index
                .put_document(SEARCH_INDEX, SEARCH_DOC_TYPE, &id, &document)
                .await
            {
                Ok(()) => exported += 1,
                Err(err) => {
                    warn!(url = %entity.url, error = %err, "search index put failed");
                }
            }
        }
        Ok(exported)
    }
}
