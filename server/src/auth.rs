// Basic-auth guard for admin endpoints.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::AppError;
use crate::state::AdminCredentials;

/// Verifies the request's `Authorization: Basic` header against the
/// configured admin credentials.
pub(crate) fn require_admin(headers: &HeaderMap, admin: &AdminCredentials) -> Result<(), AppError> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::Unauthorized)?;
    let encoded = header.strip_prefix("Basic ").ok_or(AppError::Unauthorized)?;
    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|_| AppError::Unauthorized)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AppError::Unauthorized)?;

    // The configured username never contains ':', so the first colon
    // splits unambiguously.
    let (username, password) = decoded.split_once(':').ok_or(AppError::Unauthorized)?;
    if username != admin.username || password != admin.password {
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn admin() -> AdminCredentials {
        AdminCredentials {
            username: "admin".into(),
            password: "hunter2".into(),
        }
    }

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn accepts_matching_credentials() {
        let value = format!("Basic {}", BASE64.encode("admin:hunter2"));
        assert!(require_admin(&headers_with(&value), &admin()).is_ok());
    }

    #[test]
    fn rejects_wrong_password_and_malformed_headers() {
        let wrong = format!("Basic {}", BASE64.encode("admin:letmein"));
        assert!(require_admin(&headers_with(&wrong), &admin()).is_err());
        assert!(require_admin(&HeaderMap::new(), &admin()).is_err());
        assert!(require_admin(&headers_with("Bearer token"), &admin()).is_err());
        assert!(require_admin(&headers_with("Basic ???"), &admin()).is_err());
    }

    #[test]
    fn password_may_contain_colons() {
        let admin = AdminCredentials {
            username: "admin".into(),
            password: "pass:word".into(),
        };
        let value = format!("Basic {}", BASE64.encode("admin:pass:word"));
        assert!(require_admin(&headers_with(&value), &admin).is_ok());
    }
}
