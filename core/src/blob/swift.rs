//! OpenStack Swift blob backend.
//!
//! Talks the Swift HTTP API directly with v1 auth: one GET against the
//! auth endpoint yields a storage URL and token, which are cached and
//! refreshed once on a 401. No challenge protocol.

use reqwest::StatusCode;
use tokio::io::AsyncRead;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    spool_verified, BlobBackend, BlobReader, BlobStat, ChallengeResponse, ContentChallenge,
};
use crate::config::BlobStoreConfig;
use crate::error::StoreError;

#[derive(Clone)]
struct SwiftSession {
    storage_url: String,
    token: String,
}

pub struct SwiftBackend {
    http: reqwest::Client,
    auth_url: String,
    user: String,
    key: String,
    container: String,
    session: RwLock<Option<SwiftSession>>,
}

#[derive(serde::Deserialize)]
struct SwiftObject {
    name: String,
    bytes: u64,
}

impl SwiftBackend {
    pub fn new(config: &BlobStoreConfig) -> Result<Self, StoreError> {
        let auth_url = config
            .endpoint
            .clone()
            .ok_or_else(|| StoreError::bad_request("swift blob store requires endpoint"))?;
        let user = config
            .key
            .clone()
            .ok_or_else(|| StoreError::bad_request("swift blob store requires key"))?;
        let key = config
            .secret
            .clone()
            .ok_or_else(|| StoreError::bad_request("swift blob store requires secret"))?;
        if config.bucket_name.is_empty() {
            return Err(StoreError::bad_request("swift blob store requires bucket-name"));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            auth_url,
            user,
            key,
            container: config.bucket_name.clone(),
            session: RwLock::new(None),
        })
    }

    async fn authenticate(&self) -> Result<SwiftSession, StoreError> {
        let response = self
            .http
            .get(&self.auth_url)
            .header("X-Auth-User", &self.user)
            .header("X-Auth-Key", &self.key)
            .send()
            .await
            .map_err(|err| StoreError::Internal(err.into()))?;
        if !response.status().is_success() {
            return Err(StoreError::Internal(anyhow::anyhow!(
                "swift auth failed with status {}",
                response.status()
            )));
        }

        let header = |name: &str| -> Result<String, StoreError> {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
                .ok_or_else(|| {
                    StoreError::Internal(anyhow::anyhow!("swift auth response missing {name}"))
                })
        };
        let session = SwiftSession {
            storage_url: header("X-Storage-Url")?,
            token: header("X-Auth-Token")?,
        };

        // The container is created lazily with the first session; the
        // call is idempotent.
        let container_url = format!("{}/{}", session.storage_url, self.container);
        let created = self
            .http
            .put(&container_url)
            .header("X-Auth-Token", &session.token)
            .send()
            .await
            .map_err(|err| StoreError::Internal(err.into()))?;
        debug!(status = %created.status(), container = %self.container, "ensured swift container");

        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    async fn session(&self, refresh: bool) -> Result<SwiftSession, StoreError> {
        if !refresh {
            if let Some(session) = self.session.read().await.clone() {
                return Ok(session);
            }
        }
        self.authenticate().await
    }

    fn object_url(&self, session: &SwiftSession, name: &str) -> String {
        format!("{}/{}/{}", session.storage_url, self.container, name)
    }

    /// Runs `request` with a valid token, retrying once with a fresh
    /// session when the token has expired.
    async fn with_session<F, Fut>(&self, request: F) -> Result<reqwest::Response, StoreError>
    where
        F: Fn(SwiftSession) -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let session = self.session(false).await?;
        let response = request(session)
            .await
            .map_err(|err| StoreError::Internal(err.into()))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let session = self.session(true).await?;
        request(session)
            .await
            .map_err(|err| StoreError::Internal(err.into()))
    }

    async fn store(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        hash: &str,
    ) -> Result<(), StoreError> {
        let spool = spool_verified(reader, hash).await?;
        let content = spool.read_all().await?;
        let response = self
            .with_session(|session| {
                let url = self.object_url(&session, name);
                let body = content.clone();
                async move {
                    self.http
                        .put(&url)
                        .header("X-Auth-Token", &session.token)
                        .body(body)
                        .send()
                        .await
                }
            })
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Internal(anyhow::anyhow!(
                "swift put of {name} failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobBackend for SwiftBackend {
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
        let response = self
            .with_session(|session| {
                let url = self.object_url(&session, name);
                async move {
                    self.http
                        .get(&url)
                        .header("X-Auth-Token", &session.token)
                        .send()
                        .await
                }
            })
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::not_found(format!("blob {name}")));
        }
        if !response.status().is_success() {
            return Err(StoreError::Internal(anyhow::anyhow!(
                "swift get of {name} failed with status {}",
                response.status()
            )));
        }

        let content = response
            .bytes()
            .await
            .map_err(|err| StoreError::Internal(err.into()))?;
        let size = content.len() as u64;
        Ok((BlobReader::from_bytes(content.to_vec()), size))
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        let response = self
            .with_session(|session| {
                let url = self.object_url(&session, name);
                async move {
                    self.http
                        .delete(&url)
                        .header("X-Auth-Token", &session.token)
                        .send()
                        .await
                }
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::not_found(format!("blob {name}")));
        }
        if !response.status().is_success() {
            return Err(StoreError::Internal(anyhow::anyhow!(
                "swift delete of {name} failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn stat_all(&self) -> Result<Vec<BlobStat>, StoreError> {
        let response = self
            .with_session(|session| {
                let url = format!(
                    "{}/{}?format=json",
                    session.storage_url, self.container
                );
                async move {
                    self.http
                        .get(&url)
                        .header("X-Auth-Token", &session.token)
                        .send()
                        .await
                }
            })
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Internal(anyhow::anyhow!(
                "swift listing failed with status {}",
                response.status()
            )));
        }

        let objects: Vec<SwiftObject> = response
            .json()
            .await
            .map_err(|err| StoreError::Internal(err.into()))?;
        Ok(objects
            .into_iter()
            .map(|object| BlobStat {
                name: object.name,
                size: object.bytes,
            })
            .collect())
    }
}
