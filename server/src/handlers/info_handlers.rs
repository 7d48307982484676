// Legacy per-reference metadata endpoints: /charm-info and /charm-event.
//
// Both respond 200 with a map keyed by the reference strings exactly as
// the client sent them; problems with one reference become per-entry
// error strings and never fail the whole response.

use std::collections::BTreeMap;

use axum::extract::{RawQuery, State};
use axum::Json;
use serde::Serialize;
use tracing::warn;

use charmvault_core::entity::{Entity, BZR_DIGEST_KEY};
use charmvault_core::stats::{STATS_CHARM_INFO, STATS_CHARM_MISSING};
use charmvault_core::{EntityRef, StoreError};

use crate::state::AppState;

const ENTRY_NOT_FOUND: &str = "entry not found";

#[derive(Debug, Default, Serialize, PartialEq)]
pub(crate) struct InfoResponse {
    #[serde(rename = "canonical-url", skip_serializing_if = "String::is_empty")]
    pub(crate) canonical_url: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub(crate) revision: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub(crate) sha256: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub(crate) digest: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) errors: Vec<String>,
}

#[derive(Debug, Default, Serialize, PartialEq)]
pub(crate) struct EventResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub(crate) kind: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub(crate) revision: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub(crate) digest: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub(crate) time: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) errors: Vec<String>,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

/// Values of the repeated `charms` query parameter.
fn requested_charms(query: Option<&str>) -> Vec<String> {
    let Some(query) = query else {
        return Vec::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key == "charms")
        .map(|(_, value)| value.into_owned())
        .collect()
}

/// The source-revision digest recorded in extra-info, if any. The value
/// is stored JSON-encoded.
fn stored_digest(entity: &Entity) -> Result<Option<String>, String> {
    let Some(raw) = entity.extra_info.get(BZR_DIGEST_KEY) else {
        return Ok(None);
    };
    serde_json::from_slice::<String>(raw)
        .map(Some)
        .map_err(|err| format!("cannot unmarshal digest: {err}"))
}

async fn bump_counter(state: &AppState, kind: &'static str, url: &EntityRef) {
    let mut words = vec![kind, url.series.as_str(), url.name.as_str()];
    if !url.user.is_empty() {
        words.push(url.user.as_str());
    }
    if let Err(err) = state.store.stats().increment(&words).await {
        warn!(error = %err, kind, url = %url, "cannot update stat counter");
    }
}

pub(crate) async fn charm_info_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Json<BTreeMap<String, InfoResponse>> {
    let mut responses = BTreeMap::new();
    for raw in requested_charms(query.as_deref()) {
        let response = charm_info_entry(&state, &raw).await;
        responses.insert(raw, response);
    }
    Json(responses)
}

async fn charm_info_entry(state: &AppState, raw: &str) -> InfoResponse {
    let Ok(url) = EntityRef::parse(raw) else {
        return InfoResponse {
            errors: vec![ENTRY_NOT_FOUND.to_owned()],
            ..Default::default()
        };
    };

    let entity = match state.store.resolve(&url).await {
        Ok(entity) => entity,
        Err(err) if err.is_not_found() => {
            bump_counter(state, STATS_CHARM_MISSING, &url).await;
            return InfoResponse {
                errors: vec![ENTRY_NOT_FOUND.to_owned()],
                ..Default::default()
            };
        }
        Err(err) => {
            return InfoResponse {
                errors: vec![err.to_string()],
                ..Default::default()
            };
        }
    };
    bump_counter(state, STATS_CHARM_INFO, &entity.url).await;

    let mut response = InfoResponse {
        canonical_url: entity.url.to_string(),
        revision: entity.url.revision,
        ..Default::default()
    };
    match state.store.ensure_blob_hash_256(&entity.url).await {
        Ok((sha256, _)) => response.sha256 = sha256,
        Err(err) => response.errors.push(err.to_string()),
    }
    match stored_digest(&entity) {
        Ok(Some(digest)) => response.digest = digest,
        Ok(None) => {}
        Err(message) => response.errors.push(message),
    }
    response
}

pub(crate) async fn charm_event_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Json<BTreeMap<String, EventResponse>> {
    let mut responses = BTreeMap::new();
    for raw in requested_charms(query.as_deref()) {
        let response = charm_event_entry(&state, &raw).await;
        responses.insert(raw, response);
    }
    Json(responses)
}

async fn charm_event_entry(state: &AppState, raw: &str) -> EventResponse {
    let url = match EntityRef::parse(raw) {
        Ok(url) => url,
        Err(StoreError::InvalidReference { reason, .. }) => {
            return EventResponse {
                errors: vec![format!("invalid charm URL {raw:?}: {reason}")],
                ..Default::default()
            };
        }
        Err(err) => {
            return EventResponse {
                errors: vec![err.to_string()],
                ..Default::default()
            };
        }
    };
    if url.revision != -1 {
        return EventResponse {
            errors: vec![format!("got charm URL with revision: {raw}")],
            ..Default::default()
        };
    }

    let entity = match state.store.resolve(&url).await {
        Ok(entity) => entity,
        Err(err) if err.is_not_found() => {
            return EventResponse {
                errors: vec![ENTRY_NOT_FOUND.to_owned()],
                ..Default::default()
            };
        }
        Err(err) => {
            return EventResponse {
                errors: vec![err.to_string()],
                ..Default::default()
            };
        }
    };

    let mut response = EventResponse {
        kind: "published".to_owned(),
        revision: entity.url.revision,
        time: entity.upload_time.to_rfc3339(),
        ..Default::default()
    };
    match stored_digest(&entity) {
        Ok(Some(digest)) => response.digest = digest,
        Ok(None) => {}
        Err(message) => response.errors.push(message),
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_archive, test_state};
    use charmvault_core::hash::sha256_hex;

    async fn info(state: &AppState, query: &str) -> BTreeMap<String, InfoResponse> {
        charm_info_handler(State(state.clone()), RawQuery(Some(query.to_owned())))
            .await
            .0
    }

    async fn event(state: &AppState, query: &str) -> BTreeMap<String, EventResponse> {
        charm_event_handler(State(state.clone()), RawQuery(Some(query.to_owned())))
            .await
            .0
    }

    #[tokio::test]
    async fn info_reports_canonical_url_and_lazy_sha256() {
        let state = test_state();
        let content = seed_archive(&state, "cs:precise/wordpress-1", b"wordpress archive").await;

        // A partial reference canonicalizes to the stored revision.
        let responses = info(&state, "charms=cs:wordpress").await;
        let response = &responses["cs:wordpress"];
        assert_eq!(response.canonical_url, "cs:precise/wordpress-1");
        assert_eq!(response.revision, 1);
        assert_eq!(response.sha256, sha256_hex(&content));
        assert!(response.errors.is_empty());
        assert!(response.digest.is_empty());
    }

    #[tokio::test]
    async fn info_sha256_is_persisted_after_the_first_request() {
        let state = test_state();
        seed_archive(&state, "cs:precise/wordpress-0", b"bytes").await;
        let url = EntityRef::parse("cs:precise/wordpress-0").unwrap();

        info(&state, "charms=cs:precise/wordpress-0").await;
        let (_, computed) = state.store.ensure_blob_hash_256(&url).await.unwrap();
        assert!(!computed, "handler must have persisted the digest already");
    }

    #[tokio::test]
    async fn info_missing_entries_get_per_ref_errors() {
        let state = test_state();
        let responses = info(
            &state,
            "charms=cs:precise/missing-1&charms=gopher:archie-server",
        )
        .await;
        assert_eq!(
            responses["cs:precise/missing-1"].errors,
            vec![ENTRY_NOT_FOUND.to_owned()]
        );
        assert_eq!(
            responses["gopher:archie-server"].errors,
            vec![ENTRY_NOT_FOUND.to_owned()]
        );
    }

    #[tokio::test]
    async fn info_updates_stat_counters() {
        let state = test_state();
        seed_archive(&state, "cs:utopic/wordpress-42", b"x").await;

        info(&state, "charms=cs:utopic/wordpress-42").await;
        info(&state, "charms=cs:utopic/wordpress-42").await;
        info(&state, "charms=cs:precise/django-0").await;

        let stats = state.store.stats();
        assert_eq!(
            stats
                .sum(&[STATS_CHARM_INFO, "utopic", "wordpress"])
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            stats
                .sum(&[STATS_CHARM_MISSING, "precise", "django"])
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            stats
                .sum(&[STATS_CHARM_INFO, "precise", "django"])
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn info_decodes_the_stored_digest() {
        let state = test_state();
        seed_archive(&state, "cs:precise/wordpress-1", b"x").await;
        let url = EntityRef::parse("cs:precise/wordpress-1").unwrap();
        state
            .store
            .update_extra_info(&url, BZR_DIGEST_KEY, b"\"who@canonical.com-bzr-digest\"")
            .await
            .unwrap();

        let responses = info(&state, "charms=cs:precise/wordpress-1").await;
        assert_eq!(
            responses["cs:precise/wordpress-1"].digest,
            "who@canonical.com-bzr-digest"
        );

        // A digest that is not a JSON string is reported per-ref.
        state
            .store
            .update_extra_info(&url, BZR_DIGEST_KEY, b"[]")
            .await
            .unwrap();
        let responses = info(&state, "charms=cs:precise/wordpress-1").await;
        let errors = &responses["cs:precise/wordpress-1"].errors;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("cannot unmarshal digest:"), "got {errors:?}");
    }

    #[tokio::test]
    async fn event_rejects_explicit_revisions_per_ref() {
        let state = test_state();
        let responses = event(&state, "charms=cs:precise/something-23").await;
        assert_eq!(
            responses["cs:precise/something-23"].errors,
            vec!["got charm URL with revision: cs:precise/something-23".to_owned()]
        );
    }

    #[tokio::test]
    async fn event_reports_publication() {
        let state = test_state();
        seed_archive(&state, "cs:precise/wordpress-3", b"x").await;

        let responses = event(&state, "charms=cs:precise/wordpress").await;
        let response = &responses["cs:precise/wordpress"];
        assert_eq!(response.kind, "published");
        assert_eq!(response.revision, 3);
        assert!(response.digest.is_empty(), "no digest stored, field omitted");
        assert!(
            chrono::DateTime::parse_from_rfc3339(&response.time).is_ok(),
            "time must be RFC 3339, got {:?}",
            response.time
        );
    }

    #[tokio::test]
    async fn event_not_found_and_malformed() {
        let state = test_state();
        let responses = event(&state, "charms=cs:precise/something&charms=cs:pr:ecise/x").await;
        assert_eq!(
            responses["cs:precise/something"].errors,
            vec![ENTRY_NOT_FOUND.to_owned()]
        );
        assert!(responses["cs:pr:ecise/x"].errors[0].starts_with("invalid charm URL"));
    }

    #[tokio::test]
    async fn responses_serialize_with_omitted_empty_fields() {
        let response = InfoResponse {
            errors: vec![ENTRY_NOT_FOUND.to_owned()],
            ..Default::default()
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json, serde_json::json!({ "errors": ["entry not found"] }));
    }
}
