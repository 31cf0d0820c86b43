use std::sync::OnceLock;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{extract::rejection::JsonRejection, extract::State, http::StatusCode, Json};
use sea_orm::*;
use uuid::Uuid;

use crate::db;
use crate::entities::{session, user};
use crate::error::{ApiError, ApiResult};
use crate::extract::AuthUser;
use crate::models::{AuthResponse, LoginRequest, MessageResponse, PublicUser, RegisterRequest};
use crate::state::AppState;
use crate::token;

// ─── Password helpers ───

pub fn hash_password(password: &str) -> ApiResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::Unexpected(format!("Hash error: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Hash checked against when the email is unknown, so both failure paths cost the same.
fn dummy_hash() -> &'static str {
    static DUMMY: OnceLock<String> = OnceLock::new();
    DUMMY.get_or_init(|| hash_password(&token::random_string(24)).unwrap_or_default())
}

// ─── Credentials ───

/// Open a session for `user_id` and sign a token bound to it.
pub async fn issue_credential(state: &AppState, user_id: i64) -> ApiResult<String> {
    let session_id = Uuid::new_v4().to_string();
    let (token, expires_at) = token::issue(&state.jwt_secret, user_id, &session_id, state.token_ttl)?;

    session::ActiveModel {
        id: Set(session_id),
        user_id: Set(user_id),
        created_at: Set(db::now()),
        expires_at: Set(expires_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)),
    }
    .insert(&state.db)
    .await?;

    Ok(token)
}

// ─── Routes ───

/// POST /api/register
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    let Json(req) = payload?;
    let account = req.validate().map_err(ApiError::Validation)?;

    let taken = user::Entity::find()
        .filter(user::Column::Email.eq(&account.email))
        .one(&state.db)
        .await?
        .is_some();
    if taken {
        let mut errors = crate::validation::FieldErrors::new();
        errors.add("email", "The email has already been taken.");
        return Err(ApiError::Validation(errors));
    }

    let password_hash = hash_password(&account.password)?;
    let now = db::now();

    let created = user::ActiveModel {
        name: Set(account.name),
        email: Set(account.email),
        password_hash: Set(password_hash),
        role: Set(user::Role::User),
        created_at: Set(now.clone()),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(&state.db)
    .await?;

    let token = issue_credential(&state, created.id).await?;
    tracing::info!(user_id = created.id, "User registered");

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            message: "User registered successfully",
            user: created.into(),
            token,
        }),
    ))
}

/// POST /api/login
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Json<AuthResponse>> {
    let Json(req) = payload?;
    let (email, password) = req.validate().map_err(ApiError::Validation)?;

    let found = user::Entity::find()
        .filter(user::Column::Email.eq(&email))
        .one(&state.db)
        .await?;

    let user = match found {
        Some(user) if verify_password(&password, &user.password_hash) => user,
        Some(_) => {
            tracing::warn!(%email, "Login failed");
            return Err(ApiError::InvalidCredentials);
        }
        None => {
            verify_password(&password, dummy_hash());
            tracing::warn!(%email, "Login failed");
            return Err(ApiError::InvalidCredentials);
        }
    };

    let token = issue_credential(&state, user.id).await?;
    tracing::info!(user_id = user.id, "User logged in");

    Ok(Json(AuthResponse {
        message: "Login successful",
        user: user.into(),
        token,
    }))
}

/// POST /api/logout: revoke the presented credential
pub async fn logout(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<MessageResponse>> {
    session::Entity::delete_by_id(auth.session_id)
        .exec(&state.db)
        .await?;

    Ok(Json(MessageResponse {
        message: "Logged out successfully",
    }))
}

/// GET /api/user
pub async fn current_user(auth: AuthUser) -> Json<PublicUser> {
    Json(auth.user.into())
}

// ─── First-run admin ───

/// Create an admin account if the database has no users yet.
/// Returns the generated password when an account was created.
pub async fn bootstrap_admin(db_conn: &DatabaseConnection, email: &str) -> ApiResult<Option<String>> {
    if user::Entity::find().count(db_conn).await? > 0 {
        return Ok(None);
    }

    let email = crate::validation::normalize_email(email);
    if !crate::validation::is_valid_email(&email) {
        return Err(ApiError::Unexpected(format!("Invalid admin email {email:?}")));
    }

    let temp_password = token::random_string(16);
    let now = db::now();
    user::ActiveModel {
        name: Set("Administrator".to_string()),
        email: Set(email),
        password_hash: Set(hash_password(&temp_password)?),
        role: Set(user::Role::Admin),
        created_at: Set(now.clone()),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db_conn)
    .await?;

    Ok(Some(temp_password))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_not_plaintext_and_verifies() {
        let hash = hash_password("secret1").unwrap();
        assert_ne!(hash, "secret1");
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("secret1", &hash));
        assert!(!verify_password("secret2", &hash));
    }

    #[test]
    fn test_verify_against_garbage_hash_fails() {
        assert!(!verify_password("anything", "not-a-hash"));
        assert!(!verify_password("anything", dummy_hash()));
    }

    #[tokio::test]
    async fn test_bootstrap_admin_only_on_empty_database() {
        let db_conn = db::init_pool(db::IN_MEMORY).await.unwrap();
        let password = bootstrap_admin(&db_conn, "Root@Example.com").await.unwrap().unwrap();
        assert_eq!(password.len(), 16);

        let admin = user::Entity::find().one(&db_conn).await.unwrap().unwrap();
        assert_eq!(admin.email, "root@example.com");
        assert_eq!(admin.role, user::Role::Admin);
        assert!(verify_password(&password, &admin.password_hash));

        assert!(bootstrap_admin(&db_conn, "other@example.com").await.unwrap().is_none());
    }
}
