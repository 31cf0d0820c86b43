use axum::{
    extract::{Multipart, State},
    Json,
};
use sea_orm::*;
use serde::Serialize;
use uuid::Uuid;

use crate::db;
use crate::entities::user;
use crate::error::ApiResult;
use crate::extract::AuthUser;
use crate::models::PublicUser;
use crate::state::AppState;
use crate::storage;
use crate::validation::{is_valid_email, max_chars, normalize_email, FieldErrors};

const MAX_AVATAR_SIZE: usize = 2 * 1024 * 1024; // 2MB

const ALLOWED_AVATAR_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif"];
const ALLOWED_AVATAR_EXTENSIONS: &[&str] = &["jpeg", "jpg", "png", "gif"];

fn get_extension(mime: &str) -> &str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        _ => "bin",
    }
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub message: &'static str,
    pub user: PublicUser,
}

/// Raw multipart fields of a profile update
#[derive(Debug, Default)]
struct ProfileForm {
    name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    location: Option<String>,
    bio: Option<String>,
    avatar: Option<(Vec<u8>, String, String)>, // data, content type, client filename
}

/// Empty string clears an optional column
fn optional_text(value: String) -> Option<String> {
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// POST /api/user/update: partial profile update, optional avatar
pub async fn update_profile(
    State(state): State<AppState>,
    auth: AuthUser,
    mut multipart: Multipart,
) -> ApiResult<Json<ProfileResponse>> {
    let current = auth.user;
    let mut form = ProfileForm::default();

    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "avatar" => {
                let content_type = field.content_type().unwrap_or("").to_string();
                let filename = field.file_name().unwrap_or("").to_string();
                let data = field.bytes().await?;
                if !data.is_empty() {
                    form.avatar = Some((data.to_vec(), content_type, filename));
                }
            }
            "name" | "email" | "phone" | "location" | "bio" => {
                let text = field.text().await?;
                let slot = match field_name.as_str() {
                    "name" => &mut form.name,
                    "email" => &mut form.email,
                    "phone" => &mut form.phone,
                    "location" => &mut form.location,
                    _ => &mut form.bio,
                };
                *slot = Some(text);
            }
            _ => continue,
        }
    }

    // ─── Validate ───
    let mut errors = FieldErrors::new();

    let name = form.name.as_deref().map(str::trim).filter(|n| !n.is_empty()).map(str::to_string);
    if let Some(n) = &name {
        errors.check(max_chars(n, 255), "name", "The name may not be greater than 255 characters.");
    }

    let email = form
        .email
        .as_deref()
        .map(normalize_email)
        .filter(|e| !e.is_empty());
    if let Some(e) = &email {
        errors.check(is_valid_email(e), "email", "The email must be a valid email address.");
    }

    let phone = form.phone.map(optional_text);
    let location = form.location.map(optional_text);
    let bio = form.bio.map(optional_text);
    if let Some(Some(p)) = &phone {
        errors.check(max_chars(p, 15), "phone", "The phone may not be greater than 15 characters.");
    }
    if let Some(Some(l)) = &location {
        errors.check(max_chars(l, 150), "location", "The location may not be greater than 150 characters.");
    }
    if let Some(Some(b)) = &bio {
        errors.check(max_chars(b, 200), "bio", "The bio may not be greater than 200 characters.");
    }

    if let Some((data, content_type, filename)) = &form.avatar {
        let ext_ok = storage::extension(filename)
            .map(|ext| ALLOWED_AVATAR_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(true);
        errors.check(
            ALLOWED_AVATAR_TYPES.contains(&content_type.as_str()) && ext_ok,
            "avatar",
            "The avatar must be a file of type: jpeg, png, jpg, gif.",
        );
        errors.check(
            data.len() <= MAX_AVATAR_SIZE,
            "avatar",
            "The avatar may not be greater than 2048 kilobytes.",
        );
    }

    if let Some(e) = &email {
        if errors.is_empty() {
            let taken = user::Entity::find()
                .filter(user::Column::Email.eq(e.as_str()))
                .filter(user::Column::Id.ne(current.id))
                .one(&state.db)
                .await?
                .is_some();
            errors.check(!taken, "email", "The email has already been taken.");
        }
    }

    errors.into_result()?;

    // ─── Store avatar ───
    let previous_avatar = current.avatar.clone();
    let mut new_avatar = None;
    if let Some((data, content_type, _)) = &form.avatar {
        let relative = format!("avatars/{}.{}", Uuid::new_v4(), get_extension(content_type));
        state.storage.put(&relative, data).await?;
        new_avatar = Some(state.storage.url(&relative));
    }

    // ─── Update row ───
    let mut active: user::ActiveModel = current.into();
    if let Some(n) = name {
        active.name = Set(n);
    }
    if let Some(e) = email {
        active.email = Set(e);
    }
    if let Some(p) = phone {
        active.phone = Set(p);
    }
    if let Some(l) = location {
        active.location = Set(l);
    }
    if let Some(b) = bio {
        active.bio = Set(b);
    }
    if let Some(url) = &new_avatar {
        active.avatar = Set(Some(url.clone()));
    }
    active.updated_at = Set(db::now());

    let updated = active.update(&state.db).await?;

    // Old avatar is replaced; losing track of it is harmless
    if new_avatar.is_some() {
        if let Some(old) = previous_avatar.as_deref().and_then(|u| state.storage.path_from_url(u)) {
            if let Err(e) = state.storage.delete(old).await {
                tracing::warn!(user_id = updated.id, "Could not remove previous avatar: {e}");
            }
        }
    }

    Ok(Json(ProfileResponse {
        message: "Profile updated successfully",
        user: updated.into(),
    }))
}
