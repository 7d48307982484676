// Admin endpoints, guarded by basic auth.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use tracing::info;

use crate::auth::require_admin;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub(crate) struct ExportResponse {
    pub(crate) exported: u64,
}

/// `POST /admin/export-search`: pushes every entity to the search
/// index. Intended for (re)building the index after deployment or
/// mapping changes.
pub(crate) async fn export_search_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ExportResponse>, AppError> {
    require_admin(&headers, &state.admin)?;

    let exported = state
        .store
        .export_to_search_index(state.search.as_ref())
        .await?;
    info!(exported, "search export finished");
    Ok(Json(ExportResponse { exported }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{admin_auth_header, seed_archive, test_state};
    use axum::http::header::AUTHORIZATION;

    #[tokio::test]
    async fn export_requires_credentials() {
        let state = test_state();
        let err = export_search_handler(State(state), HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }

    #[tokio::test]
    async fn export_reports_document_count() {
        let state = test_state();
        seed_archive(&state, "cs:precise/wordpress-1", b"a").await;
        seed_archive(&state, "cs:trusty/mysql-2", b"b").await;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, admin_auth_header(&state));
        let response = export_search_handler(State(state), headers).await.unwrap();
        assert_eq!(response.0.exported, 2);
    }
}
