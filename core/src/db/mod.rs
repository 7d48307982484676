pub mod entity_repo;
pub mod memory;
pub mod mongo;

use bson::doc;
use mongodb::Client;
use tracing::info;

use crate::error::StoreError;

const DATABASE_NAME: &str = "charmvault";

/// Handle on the MongoDB deployment backing the store.
///
/// The driver pools connections internally; cloning is cheap and every
/// request borrows a pooled session for the duration of one operation.
#[derive(Clone)]
pub struct Database {
    client: Client,
    db: mongodb::Database,
}

impl Database {
    /// Connects and pings the deployment so misconfiguration fails at
    /// startup instead of on the first request.
    pub async fn connect(mongo_url: &str) -> Result<Self, StoreError> {
        let uri = normalize_uri(mongo_url);
        let client = Client::with_uri_str(&uri).await?;
        let db = client.database(DATABASE_NAME);
        db.run_command(doc! { "ping": 1 }).await?;
        info!(database = DATABASE_NAME, "connected to MongoDB");
        Ok(Self { client, db })
    }

    pub fn mongo(&self) -> &mongodb::Database {
        &self.db
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Accepts the bare `host:port` form used in config files as well as
/// full connection strings, and pins the operation timeouts: metadata
/// operations give up after 30 seconds rather than hanging on an
/// unreachable deployment.
fn normalize_uri(mongo_url: &str) -> String {
    let base = if mongo_url.starts_with("mongodb://") || mongo_url.starts_with("mongodb+srv://") {
        mongo_url.to_owned()
    } else {
        format!("mongodb://{mongo_url}")
    };

    let separator = if base.contains('?') { '&' } else { '?' };
    format!(
        "{base}{separator}serverSelectionTimeoutMS=30000&connectTimeoutMS=3000&socketTimeoutMS=30000"
    )
}
