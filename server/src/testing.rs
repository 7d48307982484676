#![allow(dead_code)]

//! Shared helpers for handler tests: an app state wired to in-memory
//! backends, plus seeding shortcuts.

use std::sync::Arc;

use axum::http::HeaderValue;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use charmvault_core::blob::memory::MemoryBackend;
use charmvault_core::blob::BlobStore;
use charmvault_core::charm::{CharmData, CharmMeta};
use charmvault_core::db::memory::MemoryEntityRepository;
use charmvault_core::search::NullIndex;
use charmvault_core::{EntityRef, EntityStore};

use crate::state::{AdminCredentials, AppState};

pub const TEST_ADMIN_USERNAME: &str = "admin";
pub const TEST_ADMIN_PASSWORD: &str = "test-password";

/// App state backed entirely by in-memory stores.
pub fn test_state() -> AppState {
    AppState {
        store: EntityStore::new(
            Arc::new(MemoryEntityRepository::new()),
            BlobStore::new(Arc::new(MemoryBackend::new())),
        ),
        search: Arc::new(NullIndex),
        admin: AdminCredentials {
            username: TEST_ADMIN_USERNAME.into(),
            password: TEST_ADMIN_PASSWORD.into(),
        },
    }
}

/// Ingests `content` as a charm archive under `url`, returning the
/// content for later comparison.
pub async fn seed_archive(state: &AppState, url: &str, content: &[u8]) -> Vec<u8> {
    let url = EntityRef::parse(url).expect("valid seed URL");
    let charm = CharmData {
        meta: CharmMeta {
            name: url.name.clone(),
            ..Default::default()
        },
        config: None,
        actions: None,
    };
    let mut reader: &[u8] = content;
    state
        .store
        .add_charm_with_archive(&url, &charm, &mut reader)
        .await
        .expect("seed archive");
    content.to_vec()
}

/// `Authorization` header value matching the test admin credentials.
pub fn admin_auth_header(state: &AppState) -> HeaderValue {
    let token = BASE64.encode(format!(
        "{}:{}",
        state.admin.username, state.admin.password
    ));
    HeaderValue::from_str(&format!("Basic {token}")).expect("header value")
}
