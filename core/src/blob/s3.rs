//! S3 (and S3-compatible) blob backend.
//!
//! Streams verified uploads from the spool file and spools downloads
//! back to disk so the returned handle is seekable. No challenge
//! protocol: puts always store.

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::io::AsyncRead;

use super::{
    spool_verified, BlobBackend, BlobReader, BlobStat, ChallengeResponse, ContentChallenge,
};
use crate::config::BlobStoreConfig;
use crate::error::StoreError;

pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    pub fn new(config: &BlobStoreConfig) -> Result<Self, StoreError> {
        if config.bucket_name.is_empty() {
            return Err(StoreError::bad_request("s3 blob store requires bucket-name"));
        }

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_owned());
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .force_path_style(config.force_path_style);

        if let (Some(key), Some(secret)) = (&config.key, &config.secret) {
            builder = builder.credentials_provider(Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "blob-store-config",
            ));
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone());
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket_name.clone(),
        })
    }

    async fn store(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        hash: &str,
    ) -> Result<(), StoreError> {
        let spool = spool_verified(reader, hash).await?;
        let body = ByteStream::from_path(spool.path())
            .await
            .map_err(|err| StoreError::Internal(err.into()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(name)
            .body(body)
            .send()
            .await
            .map_err(|err| StoreError::Internal(err.into()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobBackend for S3Backend {
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
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|err| {
                let not_found = err
                    .as_service_error()
                    .map(|service| service.is_no_such_key())
                    .unwrap_or(false);
                if not_found {
                    StoreError::not_found(format!("blob {name}"))
                } else {
                    StoreError::Internal(err.into())
                }
            })?;

        let mut body = object.body.into_async_read();
        let temp = tempfile::NamedTempFile::new().map_err(StoreError::from)?;
        let mut file = tokio::fs::File::from_std(temp.reopen().map_err(StoreError::from)?);
        let size = tokio::io::copy(&mut body, &mut file).await?;
        let read_handle = tokio::fs::File::from_std(temp.reopen().map_err(StoreError::from)?);
        Ok((BlobReader::from_temp(read_handle, temp), size))
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        // S3 deletes are idempotent; a missing key is not an error at
        // the provider, which the contract permits.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|err| StoreError::Internal(err.into()))?;
        Ok(())
    }

    async fn stat_all(&self) -> Result<Vec<BlobStat>, StoreError> {
        let mut stats = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|err| StoreError::Internal(err.into()))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                stats.push(BlobStat {
                    name: key.to_owned(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                });
            }
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stats)
    }
}
