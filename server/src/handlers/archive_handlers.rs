// Archive download handler

use std::io::SeekFrom;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use charmvault_core::{EntityRef, StoreError};

use crate::error::AppError;
use crate::state::AppState;

const ARCHIVE_CONTENT_TYPE: &str = "application/octet-stream";

enum RangeRequest {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Serves `GET /{version}/{ref}/archive`.
///
/// Any version prefix serves the same bytes; partial references resolve
/// to their latest revision. A single `Range: bytes=` header is
/// honored.
pub(crate) async fn archive_handler(
    Path((_version, rest)): Path<(String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let Some(ref_str) = rest.strip_suffix("/archive") else {
        return Err(StoreError::not_found(format!("no handler for {rest:?}")).into());
    };
    let not_found =
        || StoreError::not_found(format!("no matching charm or bundle for {ref_str:?}"));

    let url = EntityRef::parse(ref_str).map_err(|_| not_found())?;
    let (mut blob, size) = state.store.open_blob(&url).await.map_err(|err| {
        if err.is_not_found() {
            not_found().into()
        } else {
            AppError::from(err)
        }
    })?;

    match parse_range(&headers, size) {
        RangeRequest::Unsatisfiable => Ok((
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{size}"))],
        )
            .into_response()),
        RangeRequest::Partial { start, end } => {
            blob.seek(SeekFrom::Start(start))
                .await
                .map_err(StoreError::from)?;
            let mut bytes = vec![0u8; (end - start + 1) as usize];
            blob.read_exact(&mut bytes)
                .await
                .map_err(StoreError::from)?;
            Ok((
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, ARCHIVE_CONTENT_TYPE.to_owned()),
                    (header::ACCEPT_RANGES, "bytes".to_owned()),
                    (
                        header::CONTENT_RANGE,
                        format!("bytes {start}-{end}/{size}"),
                    ),
                ],
                bytes,
            )
                .into_response())
        }
        RangeRequest::Full => {
            let bytes = blob.read_to_end_vec().await.map_err(StoreError::from)?;
            Ok((
                [
                    (header::CONTENT_TYPE, ARCHIVE_CONTENT_TYPE.to_owned()),
                    (header::ACCEPT_RANGES, "bytes".to_owned()),
                ],
                bytes,
            )
                .into_response())
        }
    }
}

/// Parses a single-range `bytes=` header. Malformed headers fall back
/// to a full response; a syntactically valid range beyond the end of
/// the blob is unsatisfiable.
fn parse_range(headers: &HeaderMap, size: u64) -> RangeRequest {
    let Some(raw) = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
    else {
        return RangeRequest::Full;
    };
    let Some(spec) = raw.trim().strip_prefix("bytes=") else {
        return RangeRequest::Full;
    };
    if spec.contains(',') {
        // Multi-range requests are not supported.
        return RangeRequest::Full;
    }
    let Some((start_raw, end_raw)) = spec.split_once('-') else {
        return RangeRequest::Full;
    };

    let (start, end) = match (start_raw.is_empty(), end_raw.is_empty()) {
        // bytes=-N : final N bytes
        (true, false) => {
            let Ok(suffix) = end_raw.parse::<u64>() else {
                return RangeRequest::Full;
            };
            if suffix == 0 {
                return RangeRequest::Unsatisfiable;
            }
            (size.saturating_sub(suffix), size.saturating_sub(1))
        }
        // bytes=N- : from N to the end
        (false, true) => {
            let Ok(start) = start_raw.parse::<u64>() else {
                return RangeRequest::Full;
            };
            (start, size.saturating_sub(1))
        }
        (false, false) => {
            let (Ok(start), Ok(end)) = (start_raw.parse::<u64>(), end_raw.parse::<u64>()) else {
                return RangeRequest::Full;
            };
            (start, end.min(size.saturating_sub(1)))
        }
        (true, true) => return RangeRequest::Full,
    };

    if size == 0 || start >= size || start > end {
        return RangeRequest::Unsatisfiable;
    }
    RangeRequest::Partial { start, end }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_archive, test_state};
    use axum::body::to_bytes;
    use axum::http::HeaderValue;

    async fn get_archive(state: AppState, path: &str, range: Option<&str>) -> Response {
        let mut headers = HeaderMap::new();
        if let Some(range) = range {
            headers.insert(header::RANGE, HeaderValue::from_str(range).unwrap());
        }
        archive_handler(
            Path(("v4".to_owned(), path.to_owned())),
            State(state),
            headers,
        )
        .await
        .map_or_else(IntoResponse::into_response, |response| response)
    }

    #[tokio::test]
    async fn serves_full_archives_with_length() {
        let state = test_state();
        let content = seed_archive(&state, "cs:precise/wordpress-23", b"archive payload").await;

        let response = get_archive(state, "precise/wordpress-23/archive", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok()),
            Some(content.len().to_string().as_str())
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), content.as_slice());
    }

    #[tokio::test]
    async fn resolves_partial_references_to_latest_revision() {
        let state = test_state();
        seed_archive(&state, "cs:precise/wordpress-1", b"old").await;
        let newest = seed_archive(&state, "cs:precise/wordpress-2", b"new bytes").await;

        let response = get_archive(state, "precise/wordpress/archive", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), newest.as_slice());
    }

    #[tokio::test]
    async fn honors_byte_ranges() {
        let state = test_state();
        seed_archive(&state, "cs:precise/wordpress-23", b"0123456789").await;

        let response = get_archive(
            state.clone(),
            "precise/wordpress-23/archive",
            Some("bytes=2-5"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok()),
            Some("bytes 2-5/10")
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"2345");

        let response = get_archive(
            state,
            "precise/wordpress-23/archive",
            Some("bytes=42-"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn unknown_references_are_404() {
        let state = test_state();
        for path in [
            "precise/wordpress-23/archive",
            "bad..url/archive",
            "precise/wordpress-23/noarchive",
        ] {
            let response = get_archive(state.clone(), path, None).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "path: {path}");
        }
    }
}
