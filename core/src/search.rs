use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// Index name every entity document is exported under.
pub const SEARCH_INDEX: &str = "charmvault";
/// Document type within the index.
pub const SEARCH_DOC_TYPE: &str = "entity";

/// Per-document deadline for index writes.
const PUT_TIMEOUT: Duration = Duration::from_secs(5);

/// External text index that mirrors entity metadata.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn put_document(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        document: &serde_json::Value,
    ) -> Result<()>;
}

/// Elasticsearch over its HTTP document API.
pub struct EsIndex {
    http: reqwest::Client,
    base_url: String,
}

impl EsIndex {
    /// `addr` is a `host:port` pair or a full URL.
    pub fn new(addr: &str) -> Result<Self> {
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_owned()
        } else {
            format!("http://{addr}")
        };
        let http = reqwest::Client::builder()
            .timeout(PUT_TIMEOUT)
            .build()?;
        Ok(Self { http, base_url })
    }
}

#[async_trait]
impl SearchIndex for EsIndex {
    async fn put_document(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        document: &serde_json::Value,
    ) -> Result<()> {
        let url = format!("{}/{index}/{doc_type}/{id}", self.base_url);
        let response = self.http.put(&url).json(document).send().await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "index put of {id} failed with status {}",
                response.status()
            );
        }
        Ok(())
    }
}

/// Used when no search address is configured; every put is a no-op.
pub struct NullIndex;

#[async_trait]
impl SearchIndex for NullIndex {
    async fn put_document(
        &self,
        _index: &str,
        _doc_type: &str,
        _id: &str,
        _document: &serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }
}

/// Percent-escapes an entity URL for use as an index document id.
pub fn document_id(url: &str) -> String {
    url::form_urlencoded::byte_serialize(url.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_ids_are_url_escaped() {
        assert_eq!(
            document_id("cs:~who/precise/wordpress-3"),
            "cs%3A%7Ewho%2Fprecise%2Fwordpress-3"
        );
    }

    #[tokio::test]
    async fn null_index_accepts_everything() {
        NullIndex
            .put_document(SEARCH_INDEX, SEARCH_DOC_TYPE, "id", &serde_json::json!({}))
            .await
            .unwrap();
    }

    #[test]
    fn bare_addresses_gain_a_scheme() {
        let index = EsIndex::new("localhost:9200").unwrap();
        assert_eq!(index.base_url, "http://localhost:9200");
        let index = EsIndex::new("https://search.internal/").unwrap();
        assert_eq!(index.base_url, "https://search.internal");
    }
}
