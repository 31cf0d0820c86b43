use std::path::Path;

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

// ─── JWT Claims ───

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // user id
    pub sid: String, // session row id
    pub iat: usize,
    pub exp: usize,
}

impl Claims {
    pub fn user_id(&self) -> ApiResult<i64> {
        self.sub.parse().map_err(|_| ApiError::Authentication)
    }
}

/// Sign a token for `session_id`. Returns the token and its expiry.
pub fn issue(
    secret: &str,
    user_id: i64,
    session_id: &str,
    ttl: chrono::Duration,
) -> ApiResult<(String, chrono::DateTime<chrono::Utc>)> {
    let now = chrono::Utc::now();
    let expires_at = now
        .checked_add_signed(ttl)
        .ok_or_else(|| ApiError::Unexpected("Token lifetime overflow".into()))?;

    let claims = Claims {
        sub: user_id.to_string(),
        sid: session_id.to_string(),
        iat: now.timestamp().max(0) as usize,
        exp: expires_at.timestamp().max(0) as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Unexpected(format!("JWT error: {e}")))?;

    Ok((token, expires_at))
}

/// Check signature and expiry. Revocation is checked by the caller.
pub fn verify(secret: &str, token: &str) -> ApiResult<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;

    Ok(data.claims)
}

/// Random alphanumeric string of `len` chars
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Load the signing secret from `path`, or generate one and try to persist it.
pub fn load_or_create_secret(path: &Path) -> String {
    if let Ok(saved) = std::fs::read_to_string(path) {
        let saved = saved.trim().to_string();
        if !saved.is_empty() {
            tracing::info!("Loaded JWT secret from {}", path.display());
            return saved;
        }
    }

    let secret = random_string(64);
    if let Err(e) = std::fs::write(path, &secret) {
        tracing::warn!("Could not save JWT secret to file: {e}");
    } else {
        tracing::info!("Generated and saved JWT secret to {}", path.display());
    }
    secret
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn test_issue_then_verify() {
        let (token, expires_at) = issue(SECRET, 42, "session-1", chrono::Duration::days(30)).unwrap();
        let claims = verify(SECRET, &token).unwrap();
        assert_eq!(claims.user_id().unwrap(), 42);
        assert_eq!(claims.sid, "session-1");
        assert_eq!(claims.exp, expires_at.timestamp() as usize);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let (token, _) = issue(SECRET, 1, "s", chrono::Duration::days(1)).unwrap();
        assert!(matches!(verify("other", &token), Err(ApiError::Authentication)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let (token, _) = issue(SECRET, 1, "s", chrono::Duration::days(-1)).unwrap();
        assert!(matches!(verify(SECRET, &token), Err(ApiError::Authentication)));
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(verify(SECRET, "not-a-jwt").is_err());
    }

    #[test]
    fn test_random_string_length() {
        let s = random_string(64);
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
