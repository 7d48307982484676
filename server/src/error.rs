use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use charmvault_core::StoreError;

/// HTTP-facing error type.
///
/// Store error kinds map onto the documented status codes; everything
/// unrecognized is a 500 whose cause is logged but never sent to the
/// client.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unauthorized")]
    Unauthorized,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    pub(crate) code: String,
    pub(crate) message: String,
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            Self::Store(err) => match err {
                StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                StoreError::DuplicateUpload => (StatusCode::CONFLICT, "DUPLICATE_UPLOAD"),
                StoreError::BadRequest(_) | StoreError::InvalidReference { .. } => {
                    (StatusCode::BAD_REQUEST, "BAD_REQUEST")
                }
                StoreError::HashMismatch { .. } => (StatusCode::BAD_REQUEST, "HASH_MISMATCH"),
                StoreError::ChallengeFailed => (StatusCode::BAD_REQUEST, "CHALLENGE_FAILED"),
                StoreError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "internal server error");
            "an internal error occurred".to_owned()
        } else {
            self.to_string()
        };

        let body = Json(ErrorBody {
            code: code.to_owned(),
            message,
        });

        if matches!(self, Self::Unauthorized) {
            (
                status,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"charmvault\"")],
                body,
            )
                .into_response()
        } else {
            (status, body).into_response()
        }
    }
}
