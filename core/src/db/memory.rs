//! In-memory entity repository for tests and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde_bytes::ByteBuf;

use super::entity_repo::EntityRepository;
use crate::entity::Entity;
use crate::error::StoreError;
use crate::reference::EntityRef;

#[derive(Default)]
struct MemoryTables {
    entities: BTreeMap<String, Entity>,
    counters: HashMap<String, i64>,
    tokens: HashMap<String, u32>,
    next_token_id: u32,
}

#[derive(Default)]
pub struct MemoryEntityRepository {
    tables: Mutex<MemoryTables>,
}

impl MemoryEntityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryTables> {
        self.tables.lock().expect("entity tables poisoned")
    }
}

#[async_trait::async_trait]
impl EntityRepository for MemoryEntityRepository {
    async fn insert(&self, entity: Entity) -> Result<(), StoreError> {
        let mut tables = self.lock();
        let key = entity.url.to_string();
        if tables.entities.contains_key(&key) {
            return Err(StoreError::DuplicateUpload);
        }
        tables.entities.insert(key, entity);
        Ok(())
    }

    async fn find_by_url(&self, url: &EntityRef) -> Result<Option<Entity>, StoreError> {
        Ok(self.lock().entities.get(&url.to_string()).cloned())
    }

    async fn find_by_base_url(&self, base: &EntityRef) -> Result<Vec<Entity>, StoreError> {
        let tables = self.lock();
        Ok(tables
            .entities
            .values()
            .filter(|entity| entity.base_url == *base)
            .cloned()
            .collect())
    }

    async fn update_extra_info(
        &self,
        url: &EntityRef,
        key: &str,
        value: &[u8],
    ) -> Result<(), StoreError> {
        let mut tables = self.lock();
        let entity = tables
            .entities
            .get_mut(&url.to_string())
            .ok_or_else(|| StoreError::not_found(format!("entity {url}")))?;
        entity
            .extra_info
            .insert(key.to_owned(), ByteBuf::from(value.to_vec()));
        Ok(())
    }

    async fn set_blob_hash_256(&self, url: &EntityRef, hash: &str) -> Result<bool, StoreError> {
        let mut tables = self.lock();
        let entity = tables
            .entities
            .get_mut(&url.to_string())
            .ok_or_else(|| StoreError::not_found(format!("entity {url}")))?;
        if entity.blob_hash_256.is_some() {
            return Ok(false);
        }
        entity.blob_hash_256 = Some(hash.to_owned());
        Ok(true)
    }

    async fn all_entities(&self) -> Result<Vec<Entity>, StoreError> {
        Ok(self.lock().entities.values().cloned().collect())
    }

    async fn stat_token_id(&self, token: &str) -> Result<u32, StoreError> {
        let mut tables = self.lock();
        if let Some(id) = tables.tokens.get(token) {
            return Ok(*id);
        }
        tables.next_token_id += 1;
        let id = tables.next_token_id;
        tables.tokens.insert(token.to_owned(), id);
        Ok(id)
    }

    async fn increment_counter(&self, key: &str) -> Result<(), StoreError> {
        *self.lock().counters.entry(key.to_owned()).or_insert(0) += 1;
        Ok(())
    }

    async fn counter_sum(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.lock().counters.get(key).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entity(url: &str) -> Entity {
        let url = EntityRef::parse(url).unwrap();
        Entity {
            base_url: url.base(),
            url,
            blob_name: "0123456789abcdef01234567".into(),
            blob_hash: "hash".into(),
            blob_hash_256: None,
            size: 1,
            upload_time: Utc::now(),
            charm_meta: None,
            charm_config: None,
            charm_actions: None,
            charm_provided_interfaces: Vec::new(),
            charm_required_interfaces: Vec::new(),
            bundle_data: None,
            bundle_readme: None,
            bundle_unit_count: None,
            bundle_machine_count: None,
            bundle_charms: Vec::new(),
            extra_info: Default::default(),
        }
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let repo = MemoryEntityRepository::new();
        repo.insert(entity("cs:precise/wordpress-1")).await.unwrap();
        let err = repo
            .insert(entity("cs:precise/wordpress-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUpload));
    }

    #[tokio::test]
    async fn sha256_fill_happens_once() {
        let repo = MemoryEntityRepository::new();
        let url = EntityRef::parse("cs:precise/wordpress-1").unwrap();
        repo.insert(entity("cs:precise/wordpress-1")).await.unwrap();

        assert!(repo.set_blob_hash_256(&url, "aa").await.unwrap());
        assert!(!repo.set_blob_hash_256(&url, "bb").await.unwrap());
        let stored = repo.find_by_url(&url).await.unwrap().unwrap();
        assert_eq!(stored.blob_hash_256.as_deref(), Some("aa"));
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let repo = MemoryEntityRepository::new();
        repo.increment_counter("1:2").await.unwrap();
        repo.increment_counter("1:2").await.unwrap();
        assert_eq!(repo.counter_sum("1:2").await.unwrap(), 2);
        assert_eq!(repo.counter_sum("9").await.unwrap(), 0);
    }
}
