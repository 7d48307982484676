use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration, read from a YAML file.
///
/// Recognized keys mirror the deployment documentation: `mongo-url`,
/// `api-addr`, `auth-username`, `auth-password`, `elasticsearch-addr`
/// and the `blob-store` block. Unknown keys are rejected so typos fail
/// loudly at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub mongo_url: String,
    #[serde(default)]
    pub api_addr: String,
    #[serde(default)]
    pub auth_username: String,
    #[serde(default)]
    pub auth_password: String,
    /// Optional; the search index is disabled when absent.
    #[serde(default)]
    pub elasticsearch_addr: Option<String>,
    #[serde(default)]
    pub blob_store: BlobStoreConfig,
}

/// Configuration for one blob storage backend. The optional `fallback`
/// list names additional read-only backends consulted during migration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BlobStoreConfig {
    #[serde(rename = "type", default)]
    pub provider: BlobProvider,
    /// Bucket, container, or filesystem root depending on the provider.
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub disable_ssl: bool,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub fallback: Vec<BlobStoreConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobProvider {
    GridFs,
    S3,
    Swift,
    LocalFs,
}

impl Default for BlobProvider {
    fn default() -> Self {
        BlobProvider::GridFs
    }
}

impl fmt::Display for BlobProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlobProvider::GridFs => "gridfs",
            BlobProvider::S3 => "s3",
            BlobProvider::Swift => "swift",
            BlobProvider::LocalFs => "localfs",
        };
        f.write_str(name)
    }
}

impl FromStr for BlobProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gridfs" => Ok(BlobProvider::GridFs),
            "s3" => Ok(BlobProvider::S3),
            "swift" => Ok(BlobProvider::Swift),
            "localfs" | "local" => Ok(BlobProvider::LocalFs),
            other => Err(anyhow::anyhow!(
                "unsupported blob store provider '{other}' (expected 'gridfs', 's3', 'swift' or 'localfs')"
            )),
        }
    }
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot open config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("cannot parse {}", path.display()))
    }

    /// Parses configuration from YAML text.
    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw).context("invalid YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.mongo_url.is_empty() {
            missing.push("mongo-url");
        }
        if self.api_addr.is_empty() {
            missing.push("api-addr");
        }
        if self.auth_username.is_empty() {
            missing.push("auth-username");
        }
        if self.auth_password.is_empty() {
            missing.push("auth-password");
        }
        if !missing.is_empty() {
            anyhow::bail!("missing fields {} in config file", missing.join(", "));
        }
        if self.auth_username.contains(':') {
            anyhow::bail!("invalid user name {:?} (contains ':')", self.auth_username);
        }
        Ok(())
    }
}
