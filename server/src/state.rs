use std::sync::Arc;

use tracing::info;

use charmvault_core::blob::fallback::FallbackStore;
use charmvault_core::blob::gridfs::GridFsBackend;
use charmvault_core::blob::localfs::LocalFsBackend;
use charmvault_core::blob::s3::S3Backend;
use charmvault_core::blob::swift::SwiftBackend;
use charmvault_core::blob::{BlobBackend, BlobStore};
use charmvault_core::db::mongo::MongoEntityRepository;
use charmvault_core::db::Database;
use charmvault_core::search::{EsIndex, NullIndex, SearchIndex};
use charmvault_core::{BlobProvider, BlobStoreConfig, Config, EntityStore, StoreError};

/// Basic-auth credentials guarding the admin endpoints.
#[derive(Clone)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone)]
pub struct AppState {
    pub store: EntityStore,
    pub search: Arc<dyn SearchIndex>,
    pub admin: AdminCredentials,
}

/// Wires the store together from configuration: database, entity
/// repository with its indexes, the configured blob backend (wrapped in
/// a fallback dispatcher when legacy backends are listed), and the
/// search index.
pub async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let database = Database::connect(&config.mongo_url).await?;
    let repo = MongoEntityRepository::new(&database);
    repo.ensure_indexes().await?;

    let backend = create_blob_backend(&config.blob_store, &database).await?;
    let store = EntityStore::new(Arc::new(repo), BlobStore::new(backend));

    let search: Arc<dyn SearchIndex> = match &config.elasticsearch_addr {
        Some(addr) => {
            info!(addr = %addr, "search index enabled");
            Arc::new(EsIndex::new(addr)?)
        }
        None => Arc::new(NullIndex),
    };

    Ok(AppState {
        store,
        search,
        admin: AdminCredentials {
            username: config.auth_username.clone(),
            password: config.auth_password.clone(),
        },
    })
}

pub async fn create_blob_backend(
    config: &BlobStoreConfig,
    database: &Database,
) -> Result<Arc<dyn BlobBackend>, StoreError> {
    let primary = single_backend(config, database).await?;
    if config.fallback.is_empty() {
        return Ok(primary);
    }

    let mut backends = vec![primary];
    for fallback in &config.fallback {
        backends.push(single_backend(fallback, database).await?);
    }
    info!(
        primary = %config.provider,
        fallbacks = config.fallback.len(),
        "blob store running with fallback backends"
    );
    Ok(Arc::new(FallbackStore::new(backends)?))
}

async fn single_backend(
    config: &BlobStoreConfig,
    database: &Database,
) -> Result<Arc<dyn BlobBackend>, StoreError> {
    info!(provider = %config.provider, bucket = %config.bucket_name, "initializing blob backend");
    Ok(match config.provider {
        BlobProvider::GridFs => Arc::new(GridFsBackend::new(database.mongo())),
        BlobProvider::S3 => Arc::new(S3Backend::new(config)?),
        BlobProvider::Swift => Arc::new(SwiftBackend::new(config)?),
        BlobProvider::LocalFs => {
            if config.bucket_name.is_empty() {
                return Err(StoreError::bad_request(
                    "localfs blob store requires bucket-name",
                ));
            }
            Arc::new(LocalFsBackend::new(&config.bucket_name).await?)
        }
    })
}
