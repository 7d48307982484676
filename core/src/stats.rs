//! Stat counters with a tokenized key cache.
//!
//! Counter keys are sequences of words (kind, series, name, owner).
//! Each word is mapped to a small numeric token in the database and
//! counters are stored under the colon-joined token string. The
//! word-to-token map is cached in memory behind a readers-writer lock:
//! lookups take the read lock and misses upgrade to the write lock.
//! Two cache generations bound memory; filling the fresh generation
//! retires the previous one.

use std::collections::HashMap;
use std::mem;
use std::sync::RwLock;

use crate::db::entity_repo::EntityRepositoryRef;
use crate::error::StoreError;

/// Counter kind for served legacy info requests.
pub const STATS_CHARM_INFO: &str = "charm-info";
/// Counter kind for info requests that named a missing entity.
pub const STATS_CHARM_MISSING: &str = "charm-missing";

const CACHE_GENERATION_LIMIT: usize = 1024;

#[derive(Default)]
struct TokenCache {
    fresh: HashMap<String, u32>,
    stale: HashMap<String, u32>,
}

impl TokenCache {
    fn insert(&mut self, token: &str, id: u32) {
        if self.fresh.len() >= CACHE_GENERATION_LIMIT {
            self.stale = mem::take(&mut self.fresh);
        }
        self.fresh.insert(token.to_owned(), id);
    }
}

pub struct Stats {
    repo: EntityRepositoryRef,
    cache: RwLock<TokenCache>,
}

impl Stats {
    pub fn new(repo: EntityRepositoryRef) -> Self {
        Self {
            repo,
            cache: RwLock::new(TokenCache::default()),
        }
    }

    async fn token_id(&self, token: &str) -> Result<u32, StoreError> {
        if let Some(id) = self
            .cache
            .read()
            .expect("token cache poisoned")
            .fresh
            .get(token)
            .copied()
        {
            return Ok(id);
        }

        {
            let mut cache = self.cache.write().expect("token cache poisoned");
            if let Some(id) = cache.fresh.get(token).copied() {
                return Ok(id);
            }
            if let Some(id) = cache.stale.get(token).copied() {
                cache.insert(token, id);
                return Ok(id);
            }
        }

        // The lock is not held across the database call.
        let id = self.repo.stat_token_id(token).await?;
        self.cache
            .write()
            .expect("token cache poisoned")
            .insert(token, id);
        Ok(id)
    }

    /// Tokenized counter key for a sequence of words.
    pub async fn key(&self, words: &[&str]) -> Result<String, StoreError> {
        let mut parts = Vec::with_capacity(words.len());
        for word in words {
            parts.push(self.token_id(word).await?.to_string());
        }
        Ok(parts.join(":"))
    }

    pub async fn increment(&self, words: &[&str]) -> Result<(), StoreError> {
        let key = self.key(words).await?;
        self.repo.increment_counter(&key).await
    }

    pub async fn sum(&self, words: &[&str]) -> Result<i64, StoreError> {
        let key = self.key(words).await?;
        self.repo.counter_sum(&key).await
    }
}
