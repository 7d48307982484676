//! In-memory blob backend used for local development and tests.
//!
//! Implements the same hash-dedup challenge protocol as the GridFS
//! backend so the proof-of-content flow can be exercised without a
//! database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncRead;

use super::{
    random_challenge_range, spool_verified, BlobBackend, BlobReader, BlobStat, ChallengeResponse,
    ContentChallenge, DEFAULT_CHALLENGE_TTL,
};
use crate::error::StoreError;
use crate::hash::sha384_hex;

struct PendingChallenge {
    hash: String,
    range_start: u64,
    range_length: u64,
    expires: Instant,
}

#[derive(Default)]
struct MemoryState {
    /// path -> content
    blobs: BTreeMap<String, Vec<u8>>,
    /// content hash -> path
    resources: BTreeMap<String, String>,
    /// blob name -> path
    managed: BTreeMap<String, String>,
    /// request id -> pending challenge
    challenges: BTreeMap<String, PendingChallenge>,
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    next_request_id: AtomicU64,
    challenge_ttl: Duration,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::with_challenge_ttl(DEFAULT_CHALLENGE_TTL)
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_challenge_ttl(challenge_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            next_request_id: AtomicU64::new(1),
            challenge_ttl,
        }
    }

    fn path_for(name: &str) -> String {
        format!("global/{name}")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory blob state poisoned")
    }

    /// Records `name` as a reference to already-stored bytes after a
    /// successful proof, or reports why the proof cannot be honored.
    fn apply_proof(&self, name: &str, proof: &ChallengeResponse) -> Result<ProofOutcome, StoreError> {
        let mut state = self.lock();
        let Some(challenge) = state.challenges.remove(&proof.request_id) else {
            return Err(StoreError::ChallengeFailed);
        };
        if challenge.expires < Instant::now() {
            return Err(StoreError::ChallengeFailed);
        }

        let Some(path) = state.resources.get(&challenge.hash).cloned() else {
            // The canonical blob vanished since the challenge was issued.
            return Ok(ProofOutcome::ContentGone);
        };
        let Some(content) = state.blobs.get(&path) else {
            return Ok(ProofOutcome::ContentGone);
        };

        let start = challenge.range_start as usize;
        let end = (challenge.range_start + challenge.range_length) as usize;
        if end > content.len() {
            return Ok(ProofOutcome::ContentGone);
        }
        if sha384_hex(&content[start..end]) != proof.range_hash {
            return Err(StoreError::ChallengeFailed);
        }

        state.managed.insert(name.to_owned(), path);
        Ok(ProofOutcome::Recorded)
    }

    /// Issues a challenge when bytes with `hash` are already stored.
    fn maybe_challenge(&self, hash: &str) -> Option<ContentChallenge> {
        let mut state = self.lock();
        let path = state.resources.get(hash)?.clone();
        let size = state.blobs.get(&path)?.len() as u64;
        let (range_start, range_length) = random_challenge_range(size);
        let request_id = self
            .next_request_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        state.challenges.insert(
            request_id.clone(),
            PendingChallenge {
                hash: hash.to_owned(),
                range_start,
                range_length,
                expires: Instant::now() + self.challenge_ttl,
            },
        );
        Some(ContentChallenge {
            request_id,
            range_start,
            range_length,
        })
    }

    async fn store(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        hash: &str,
    ) -> Result<(), StoreError> {
        let spool = spool_verified(reader, hash).await?;
        let content = spool.read_all().await?;
        let path = Self::path_for(name);
        let mut state = self.lock();
        state.blobs.insert(path.clone(), content);
        state.resources.insert(hash.to_owned(), path.clone());
        state.managed.insert(name.to_owned(), path);
        Ok(())
    }

    /// Records a dedup reference without a challenge; used by the
    /// trusted unchallenged path.
    fn try_dedup(&self, name: &str, hash: &str) -> bool {
        let mut state = self.lock();
        let Some(path) = state.resources.get(hash).cloned() else {
            return false;
        };
        if !state.blobs.contains_key(&path) {
            return false;
        }
        state.managed.insert(name.to_owned(), path);
        true
    }
}

enum ProofOutcome {
    Recorded,
    ContentGone,
}

#[async_trait]
impl BlobBackend for MemoryBackend {
    async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        _size: u64,
        hash: &str,
        proof: Option<&ChallengeResponse>,
    ) -> Result<Option<ContentChallenge>, StoreError> {
        if let Some(proof) = proof {
            match self.apply_proof(name, proof)? {
                ProofOutcome::Recorded => return Ok(None),
                ProofOutcome::ContentGone => {
                    // Ask the client for the bytes after all.
                    self.store(reader, name, hash).await?;
                    return Ok(None);
                }
            }
        }

        if let Some(challenge) = self.maybe_challenge(hash) {
            return Ok(Some(challenge));
        }

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
        if self.try_dedup(name, hash) {
            return Ok(());
        }
        self.store(reader, name, hash).await
    }

    async fn open(&self, name: &str) -> Result<(BlobReader, u64), StoreError> {
        let state = self.lock();
        let content = state
            .managed
            .get(name)
            .and_then(|path| state.blobs.get(path))
            .ok_or_else(|| StoreError::not_found(format!("blob {name}")))?;
        let size = content.len() as u64;
        Ok((BlobReader::from_bytes(content.clone()), size))
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.managed.remove(name).is_none() {
            return Err(StoreError::not_found(format!("blob {name}")));
        }
        Ok(())
    }

    async fn stat_all(&self) -> Result<Vec<BlobStat>, StoreError> {
        let state = self.lock();
        Ok(state
            .blobs
            .iter()
            .map(|(path, content)| BlobStat {
                name: path.strip_prefix("global/").unwrap_or(path).to_owned(),
                size: content.len() as u64,
            })
            .collect())
    }
}
