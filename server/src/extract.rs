use axum::{extract::FromRequestParts, http::request::Parts, RequestPartsExt};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use sea_orm::EntityTrait;

use crate::entities::{session, user};
use crate::error::{ApiError, ApiResult};
use crate::permissions::{self, Access};
use crate::state::AppState;
use crate::token;

/// Authenticated principal, reloaded from the database on every request
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: user::Model,
    pub session_id: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| ApiError::Authentication)?;

        authenticate(state, bearer.token()).await
    }
}

/// Resolve a bearer token to its user. Fails if the token is bad, expired,
/// or its session has been revoked.
pub async fn authenticate(state: &AppState, token: &str) -> ApiResult<AuthUser> {
    let claims = token::verify(&state.jwt_secret, token)?;
    let user_id = claims.user_id()?;

    let session = session::Entity::find_by_id(claims.sid.clone())
        .one(&state.db)
        .await?
        .filter(|s| s.user_id == user_id)
        .ok_or(ApiError::Authentication)?;

    let user = user::Entity::find_by_id(user_id)
        .one(&state.db)
        .await?
        .ok_or(ApiError::Authentication)?;

    Ok(AuthUser {
        user,
        session_id: session.id,
    })
}

/// Authenticated principal whose role passed [`permissions::admin_gate`]
#[derive(Debug, Clone)]
pub struct AdminUser(pub user::Model);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let AuthUser { user, .. } = AuthUser::from_request_parts(parts, state).await?;

        match permissions::admin_gate(&user) {
            Access::Granted => Ok(AdminUser(user)),
            Access::Denied(reason) => {
                tracing::warn!(user_id = user.id, "Admin route refused");
                Err(ApiError::Forbidden(reason.to_string()))
            }
        }
    }
}
