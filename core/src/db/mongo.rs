use bson::{doc, Binary, Bson, Document};
use chrono::Utc;
use futures_util::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Collection, IndexModel};

use super::entity_repo::EntityRepository;
use super::Database;
use crate::entity::Entity;
use crate::error::StoreError;
use crate::reference::EntityRef;

const ENTITIES_COLLECTION: &str = "entities";
const COUNTERS_COLLECTION: &str = "stat.counters";
const TOKENS_COLLECTION: &str = "stat.tokens";
const SEQUENCES_COLLECTION: &str = "stat.sequences";

/// Counters are bucketed by hour so sums can later be windowed.
const COUNTER_BUCKET_SECS: i64 = 3600;

pub struct MongoEntityRepository {
    entities: Collection<Entity>,
    counters: Collection<Document>,
    tokens: Collection<Document>,
    sequences: Collection<Document>,
}

impl MongoEntityRepository {
    pub fn new(database: &Database) -> Self {
        let db = database.mongo();
        Self {
            entities: db.collection(ENTITIES_COLLECTION),
            counters: db.collection(COUNTERS_COLLECTION),
            tokens: db.collection(TOKENS_COLLECTION),
            sequences: db.collection(SEQUENCES_COLLECTION),
        }
    }

    /// Creates the indexes every deployment relies on: base-URL and
    /// upload-time lookups on entities, uniqueness for counters and
    /// stat tokens.
    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        self.entities
            .create_indexes(vec![
                IndexModel::builder().keys(doc! { "base_url": 1 }).build(),
                IndexModel::builder().keys(doc! { "upload_time": 1 }).build(),
            ])
            .await?;
        self.counters
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "k": 1, "t": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await?;
        self.tokens
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "t": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await?;
        Ok(())
    }

    async fn next_sequence(&self, name: &str) -> Result<i64, StoreError> {
        let counter = self
            .sequences
            .find_one_and_update(doc! { "_id": name }, doc! { "$inc": { "seq": 1i64 } })
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?
            .ok_or_else(|| {
                StoreError::Internal(anyhow::anyhow!("sequence upsert returned nothing"))
            })?;
        counter
            .get_i64("seq")
            .map_err(|err| StoreError::Internal(err.into()))
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == 11000
    )
}

fn counter_bucket() -> i64 {
    let now = Utc::now().timestamp();
    now - now.rem_euclid(COUNTER_BUCKET_SECS)
}

#[async_trait::async_trait]
impl EntityRepository for MongoEntityRepository {
    async fn insert(&self, entity: Entity) -> Result<(), StoreError> {
        match self.entities.insert_one(entity).await {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => Err(StoreError::DuplicateUpload),
            Err(err) => Err(err.into()),
        }
    }

    async fn find_by_url(&self, url: &EntityRef) -> Result<Option<Entity>, StoreError> {
        Ok(self
            .entities
            .find_one(doc! { "_id": url.to_string() })
            .await?)
    }

    async fn find_by_base_url(&self, base: &EntityRef) -> Result<Vec<Entity>, StoreError> {
        let cursor = self
            .entities
            .find(doc! { "base_url": base.to_string() })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn update_extra_info(
        &self,
        url: &EntityRef,
        key: &str,
        value: &[u8],
    ) -> Result<(), StoreError> {
        if key.is_empty() || key.contains('.') || key.starts_with('$') {
            return Err(StoreError::bad_request(format!(
                "invalid extra-info key {key:?}"
            )));
        }
        let binary = Bson::Binary(Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: value.to_vec(),
        });
        let result = self
            .entities
            .update_one(
                doc! { "_id": url.to_string() },
                doc! { "$set": { format!("extra_info.{key}"): binary } },
            )
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::not_found(format!("entity {url}")));
        }
        Ok(())
    }

    async fn set_blob_hash_256(&self, url: &EntityRef, hash: &str) -> Result<bool, StoreError> {
        let result = self
            .entities
            .update_one(
                doc! {
                    "_id": url.to_string(),
                    "blob_hash_256": { "$exists": false },
                },
                doc! { "$set": { "blob_hash_256": hash } },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn all_entities(&self) -> Result<Vec<Entity>, StoreError> {
        let cursor = self.entities.find(doc! {}).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn stat_token_id(&self, token: &str) -> Result<u32, StoreError> {
        if let Some(existing) = self.tokens.find_one(doc! { "t": token }).await? {
            let id = existing
                .get_i64("_id")
                .map_err(|err| StoreError::Internal(err.into()))?;
            return Ok(id as u32);
        }

        let id = self.next_sequence("stat-token").await?;
        match self.tokens.insert_one(doc! { "_id": id, "t": token }).await {
            Ok(_) => Ok(id as u32),
            Err(err) if is_duplicate_key(&err) => {
                // Lost an allocation race; the winner's id stands.
                let existing = self
                    .tokens
                    .find_one(doc! { "t": token })
                    .await?
                    .ok_or_else(|| {
                        StoreError::Internal(anyhow::anyhow!("stat token vanished after race"))
                    })?;
                let id = existing
                    .get_i64("_id")
                    .map_err(|err| StoreError::Internal(err.into()))?;
                Ok(id as u32)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn increment_counter(&self, key: &str) -> Result<(), StoreError> {
        self.counters
            .update_one(
                doc! { "k": key, "t": counter_bucket() },
                doc! { "$inc": { "c": 1i64 } },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn counter_sum(&self, key: &str) -> Result<i64, StoreError> {
        let mut cursor = self.counters.find(doc! { "k": key }).await?;
        let mut total = 0i64;
        while let Some(entry) = cursor.try_next().await? {
            total += entry.get_i64("c").unwrap_or(0);
        }
        Ok(total)
    }
}
