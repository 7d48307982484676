use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::Entity;
use crate::error::StoreError;
use crate::reference::EntityRef;

/// Persistence contract for entity metadata and stat counters.
///
/// The MongoDB implementation is the production store; the in-memory
/// implementation backs unit tests and local development. Inserting a
/// URL that already exists fails with `DuplicateUpload`; lookups return
/// `Ok(None)` / empty collections for missing documents and `Internal`
/// only for driver failures.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    async fn insert(&self, entity: Entity) -> Result<(), StoreError>;

    async fn find_by_url(&self, url: &EntityRef) -> Result<Option<Entity>, StoreError>;

    async fn find_by_base_url(&self, base: &EntityRef) -> Result<Vec<Entity>, StoreError>;

    /// Stores an opaque extra-info value under `key`. `NotFound` when
    /// the entity does not exist.
    async fn update_extra_info(
        &self,
        url: &EntityRef,
        key: &str,
        value: &[u8],
    ) -> Result<(), StoreError>;

    /// Fills the lazily computed SHA-256 field, returning whether this
    /// call performed the write (false when the field was already set).
    async fn set_blob_hash_256(&self, url: &EntityRef, hash: &str) -> Result<bool, StoreError>;

    /// Every stored entity, for the search export sweep.
    async fn all_entities(&self) -> Result<Vec<Entity>, StoreError>;

    /// Numeric id for a stat key token, allocating one on first use.
    async fn stat_token_id(&self, token: &str) -> Result<u32, StoreError>;

    /// Bumps the counter for a tokenized key in the current time bucket.
    async fn increment_counter(&self, key: &str) -> Result<(), StoreError>;

    /// Sum of a tokenized key's counter across all time buckets.
    async fn counter_sum(&self, key: &str) -> Result<i64, StoreError>;
}

pub type EntityRepositoryRef = Arc<dyn EntityRepository>;
