//! MongoDB GridFS blob backend with content-hash deduplication.
//!
//! Bytes are stored once per content hash under `path = "global/<name>"`
//! of the first blob name that carried them. Two side tables make the
//! sharing explicit: `entitystore.resources` maps a SHA-384 hash to the
//! canonical path, and `entitystore.managed` maps every blob name to the
//! path it references. A client naming a hash the store already holds is
//! not trusted: it is handed a [`ContentChallenge`] over a random byte
//! range and only a correct proof records the new reference without an
//! upload.

use std::time::Duration;

use bson::doc;
use chrono::{DateTime, Utc};
use futures_util::io::{AsyncReadExt as FuturesAsyncReadExt, AsyncWriteExt as FuturesAsyncWriteExt};
use futures_util::TryStreamExt;
use mongodb::gridfs::{GridFsBucket, GridFsDownloadStream};
use mongodb::options::{GridFsBucketOptions, ReturnDocument};
use mongodb::Collection;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{
    random_challenge_range, spool_verified, BlobBackend, BlobReader, BlobStat, ChallengeResponse,
    ContentChallenge, Spool, DEFAULT_CHALLENGE_TTL,
};
use crate::error::StoreError;
use crate::hash::HashSink;

const BUCKET_NAME: &str = "entitystore";
const RESOURCES_COLLECTION: &str = "entitystore.resources";
const MANAGED_COLLECTION: &str = "entitystore.managed";
const CHALLENGES_COLLECTION: &str = "entitystore.challenges";
const COUNTERS_COLLECTION: &str = "entitystore.counters";

/// sha384 hash -> canonical path of the stored bytes.
#[derive(Debug, Serialize, Deserialize)]
struct StoredResource {
    #[serde(rename = "_id")]
    hash: String,
    path: String,
}

/// blob name -> path it references.
#[derive(Debug, Serialize, Deserialize)]
struct ManagedResource {
    #[serde(rename = "_id")]
    name: String,
    path: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingChallenge {
    #[serde(rename = "_id")]
    request_id: String,
    hash: String,
    range_start: i64,
    range_length: i64,
    expires: DateTime<Utc>,
}

pub struct GridFsBackend {
    bucket: GridFsBucket,
    resources: Collection<StoredResource>,
    managed: Collection<ManagedResource>,
    challenges: Collection<PendingChallenge>,
    counters: Collection<bson::Document>,
    challenge_ttl: Duration,
}

impl GridFsBackend {
    pub fn new(db: &mongodb::Database) -> Self {
        Self::with_challenge_ttl(db, DEFAULT_CHALLENGE_TTL)
    }

    pub fn with_challenge_ttl(db: &mongodb::Database, challenge_ttl: Duration) -> Self {
        let options = GridFsBucketOptions::builder()
            .bucket_name(BUCKET_NAME.to_owned())
            .build();
        Self {
            bucket: db.gridfs_bucket(options),
            resources: db.collection(RESOURCES_COLLECTION),
            managed: db.collection(MANAGED_COLLECTION),
            challenges: db.collection(CHALLENGES_COLLECTION),
            counters: db.collection(COUNTERS_COLLECTION),
            challenge_ttl,
        }
    }

    fn path_for(name: &str) -> String {
        format!("global/{name}")
    }

    async fn next_request_id(&self) -> Result<String, StoreError> {
        let counter = self
            .counters
            .find_one_and_update(
                doc! { "_id": "challenge-request" },
                doc! { "$inc": { "seq": 1i64 } },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?
            .ok_or_else(|| StoreError::Internal(anyhow::anyhow!("counter upsert returned nothing")))?;
        let seq = counter
            .get_i64("seq")
            .map_err(|err| StoreError::Internal(err.into()))?;
        Ok(seq.to_string())
    }

    /// Byte length of the canonical file at `path`, when it still exists.
    async fn stored_length(&self, path: &str) -> Result<Option<u64>, StoreError> {
        let mut cursor = self.bucket.find(doc! { "filename": path }).await?;
        Ok(cursor.try_next().await?.map(|file| file.length))
    }

    async fn open_path(&self, path: &str) -> Result<Option<GridFsDownloadStream>, StoreError> {
        // Probe the files collection first so a vanished blob reads as
        // absent instead of surfacing a driver error.
        if self.stored_length(path).await?.is_none() {
            return Ok(None);
        }
        Ok(Some(self.bucket.open_download_stream_by_name(path).await?))
    }

    /// Hashes `[start, start+length)` of the canonical bytes at `path`.
    async fn hash_stored_range(
        &self,
        path: &str,
        start: u64,
        length: u64,
    ) -> Result<Option<String>, StoreError> {
        let Some(mut stream) = self.open_path(path).await? else {
            return Ok(None);
        };

        let mut buf = vec![0u8; 64 * 1024];
        let mut to_skip = start;
        while to_skip > 0 {
            let want = to_skip.min(buf.len() as u64) as usize;
            let n = stream.read(&mut buf[..want]).await?;
            if n == 0 {
                return Ok(None);
            }
            to_skip -= n as u64;
        }

        let mut sink = HashSink::new();
        let mut remaining = length;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = stream.read(&mut buf[..want]).await?;
            if n == 0 {
                return Ok(None);
            }
            std::io::Write::write_all(&mut sink, &buf[..n])?;
            remaining -= n as u64;
        }
        Ok(Some(sink.hex_digest()))
    }

    /// Uploads spooled content under `path` and records both side-table
    /// entries.
    async fn store(&self, spool: &Spool, name: &str) -> Result<(), StoreError> {
        let path = Self::path_for(name);
        let mut upload = self.bucket.open_upload_stream(&path).await?;
        let mut file = spool.reopen()?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            upload.write_all(&buf[..n]).await?;
        }
        upload.close().await?;

        self.resources
            .update_one(
                doc! { "_id": &spool.hash },
                doc! { "$set": { "path": &path } },
            )
            .upsert(true)
            .await?;
        self.record_reference(name, &path).await
    }

    async fn record_reference(&self, name: &str, path: &str) -> Result<(), StoreError> {
        self.managed
            .update_one(doc! { "_id": name }, doc! { "$set": { "path": path } })
            .upsert(true)
            .await?;
        Ok(())
    }

    /// Issues a challenge when the hash is already stored. `None` means
    /// the caller must upload the bytes.
    async fn maybe_challenge(&self, hash: &str) -> Result<Option<ContentChallenge>, StoreError> {
        let Some(resource) = self.resources.find_one(doc! { "_id": hash }).await? else {
            return Ok(None);
        };
        let Some(size) = self.stored_length(&resource.path).await? else {
            // Hash entry is stale; the bytes were collected.
            return Ok(None);
        };

        let (range_start, range_length) = random_challenge_range(size);
        let request_id = self.next_request_id().await?;
        self.challenges
            .insert_one(PendingChallenge {
                request_id: request_id.clone(),
                hash: hash.to_owned(),
                range_start: range_start as i64,
                range_length: range_length as i64,
                expires: Utc::now()
                    + chrono::Duration::from_std(self.challenge_ttl)
                        .unwrap_or_else(|_| chrono::Duration::seconds(900)),
            })
            .await?;
        debug!(%request_id, range_start, range_length, "issued content challenge");
        Ok(Some(ContentChallenge {
            request_id,
            range_start,
            range_length,
        }))
    }

    async fn apply_proof(
        &self,
        name: &str,
        proof: &ChallengeResponse,
    ) -> Result<ProofOutcome, StoreError> {
        let challenge = self
            .challenges
            .find_one_and_delete(doc! { "_id": &proof.request_id })
            .await?
            .ok_or(StoreError::ChallengeFailed)?;
        if challenge.expires < Utc::now() {
            return Err(StoreError::ChallengeFailed);
        }

        let Some(resource) = self.resources.find_one(doc! { "_id": &challenge.hash }).await?
        else {
            return Ok(ProofOutcome::ContentGone);
        };
        let Some(expected) = self
            .hash_stored_range(
                &resource.path,
                challenge.range_start as u64,
                challenge.range_length as u64,
            )
            .await?
        else {
            return Ok(ProofOutcome::ContentGone);
        };

        if expected != proof.range_hash {
            return Err(StoreError::ChallengeFailed);
        }
        self.record_reference(name, &resource.path).await?;
        Ok(ProofOutcome::Recorded)
    }
}

enum ProofOutcome {
    Recorded,
    ContentGone,
}

#[async_trait::async_trait]
impl BlobBackend for GridFsBackend {
    async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        _size: u64,
        hash: &str,
        proof: Option<&ChallengeResponse>,
    ) -> Result<Option<ContentChallenge>, StoreError> {
        if let Some(proof) = proof {
            match self.apply_proof(name, proof).await? {
                ProofOutcome::Recorded => return Ok(None),
                ProofOutcome::ContentGone => {
                    let spool = spool_verified(reader, hash).await?;
                    self.store(&spool, name).await?;
                    return Ok(None);
                }
            }
        }

        if let Some(challenge) = self.maybe_challenge(hash).await? {
            return Ok(Some(challenge));
        }

        let spool = spool_verified(reader, hash).await?;
        self.store(&spool, name).await?;
        Ok(None)
    }

    async fn put_unchallenged(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        _size: u64,
        hash: &str,
    ) -> Result<(), StoreError> {
        // The caller hashed the content itself, so an existing resource
        // entry can be referenced directly.
        if let Some(resource) = self.resources.find_one(doc! { "_id": hash }).await? {
            if self.stored_length(&resource.path).await?.is_some() {
                return self.record_reference(name, &resource.path).await;
            }
        }
        let spool = spool_verified(reader, hash).await?;
        self.store(&spool, name).await
    }

    async fn open(&self, name: &str) -> Result<(BlobReader, u64), StoreError> {
        let resource = self
            .managed
            .find_one(doc! { "_id": name })
            .await?
            .ok_or_else(|| StoreError::not_found(format!("blob {name}")))?;
        let Some(mut stream) = self.open_path(&resource.path).await? else {
            return Err(StoreError::not_found(format!("blob {name}")));
        };

        let temp = NamedTempFile::new().map_err(StoreError::from)?;
        let mut file = tokio::fs::File::from_std(temp.reopen().map_err(StoreError::from)?);
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            size += n as u64;
        }
        file.flush().await?;

        let read_handle = tokio::fs::File::from_std(temp.reopen().map_err(StoreError::from)?);
        Ok((BlobReader::from_temp(read_handle, temp), size))
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        let result = self.managed.delete_one(doc! { "_id": name }).await?;
        if result.deleted_count == 0 {
            return Err(StoreError::not_found(format!("blob {name}")));
        }
        Ok(())
    }

    async fn stat_all(&self) -> Result<Vec<BlobStat>, StoreError> {
        let mut cursor = self.bucket.find(doc! {}).await?;
        let mut stats = Vec::new();
        while let Some(file) = cursor.try_next().await? {
            let Some(filename) = file.filename else {
                continue;
            };
            let name = filename
                .strip_prefix("global/")
                .unwrap_or(&filename)
                .to_owned();
            stats.push(BlobStat {
                name,
                size: file.length,
            });
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stats)
    }
}
