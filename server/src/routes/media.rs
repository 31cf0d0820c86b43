use axum::{
    extract::{rejection::JsonRejection, Multipart, State},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use sea_orm::*;

use crate::db;
use crate::entities::result;
use crate::error::{ApiError, ApiResult};
use crate::extract::AuthUser;
use crate::models::{SaveResultRequest, SavedResult, StoredMedia};
use crate::report::{self, ReportInput};
use crate::state::AppState;
use crate::storage::{self, Storage};
use crate::validation::FieldErrors;

pub const MAX_MEDIA_SIZE: usize = 100 * 1024 * 1024; // 100MB

const ALLOWED_MEDIA_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "jpg", "jpeg", "jfif"];
const ALLOWED_MEDIA_TYPES: &[&str] = &[
    "video/mp4",
    "video/quicktime",
    "video/x-msvideo",
    "video/avi",
    "video/msvideo",
    "image/jpeg",
    "image/pjpeg",
    "image/jfif",
];

/// MIME type implied by an allowed extension
fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        _ => "image/jpeg",
    }
}

/// POST /api/videos/upload: store one media file in the caller's folder
pub async fn upload_media(
    State(state): State<AppState>,
    auth: AuthUser,
    mut multipart: Multipart,
) -> ApiResult<Json<StoredMedia>> {
    let user = auth.user;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("video") {
            continue;
        }

        let client_name = field.file_name().unwrap_or("").to_string();
        let ext = storage::extension(&client_name)
            .filter(|ext| ALLOWED_MEDIA_EXTENSIONS.contains(&ext.as_str()));
        let Some(ext) = ext else {
            return Err(invalid_media("The video must be a file of type: mp4, mov, avi, jpg, jpeg, jfif."));
        };

        // A missing or generic type falls back to what the extension implies
        let content_type = match field.content_type() {
            None | Some("application/octet-stream") => mime_for_extension(&ext).to_string(),
            Some(ct) => ct.to_ascii_lowercase(),
        };
        if !ALLOWED_MEDIA_TYPES.contains(&content_type.as_str()) {
            return Err(invalid_media("The video must be a file of type: mp4, mov, avi, jpg, jpeg, jfif."));
        }

        let data = field.bytes().await?;
        if data.is_empty() {
            return Err(invalid_media("The video field is required."));
        }
        if data.len() > MAX_MEDIA_SIZE {
            return Err(invalid_media("The video may not be greater than 102400 kilobytes."));
        }

        let folder = format!("uploads/{}", user.id);
        let filename = state
            .storage
            .put_sequenced(&folder, &user.name, &ext, &data)
            .await?;
        let path = format!("{folder}/{filename}");
        tracing::info!(user_id = user.id, %path, size = data.len(), "Media stored");

        return Ok(Json(StoredMedia {
            url: state.storage.url(&path),
            filename,
            path,
        }));
    }

    Err(invalid_media("The video field is required."))
}

fn invalid_media(message: &str) -> ApiError {
    let mut errors = FieldErrors::new();
    errors.add("video", message);
    ApiError::Validation(errors)
}

/// Decode `data:image/<kind>;base64,<payload>`. Returns extension and bytes.
pub fn decode_data_url(value: &str) -> Option<(&'static str, Vec<u8>)> {
    let rest = value.strip_prefix("data:image/")?;
    let (meta, payload) = rest.split_once(',')?;
    let kind = meta.strip_suffix(";base64")?;
    let ext = match kind {
        "png" => "png",
        "jpeg" | "jpg" => "jpg",
        "gif" => "gif",
        "webp" => "webp",
        _ => return None,
    };
    let bytes = STANDARD.decode(payload.trim()).ok()?;
    Some((ext, bytes))
}

/// Folder holding the LIME images stored for `user_id`
fn lime_folder(user_id: i64) -> String {
    format!("lime/{user_id}/")
}

/// Disk path behind a LIME reference, only when it sits in `user_id`'s own
/// LIME folder. External URLs and anything else on the disk give `None`.
pub fn owned_lime_path<'a>(storage: &Storage, user_id: i64, url: &'a str) -> Option<&'a str> {
    let relative = storage.path_from_url(url)?;
    let inside = relative.starts_with(&lime_folder(user_id))
        && relative.split('/').all(|part| !part.is_empty() && part != "." && part != "..");
    inside.then_some(relative)
}

/// POST /api/videos/save-results: render the report and persist the outcome
pub async fn save_results(
    State(state): State<AppState>,
    auth: AuthUser,
    payload: Result<Json<SaveResultRequest>, JsonRejection>,
) -> ApiResult<Json<SavedResult>> {
    let Json(req) = payload?;
    let input = req.validate().map_err(ApiError::Validation)?;
    let user = auth.user;
    let stem = storage::file_stem(&input.filename);

    // Inline LIME images are moved onto the disk; external URLs are kept as given
    let lime_image = match input.lime_image.as_deref() {
        Some(raw) if raw.starts_with("data:") => {
            let (ext, bytes) = decode_data_url(raw).ok_or_else(|| {
                let mut errors = FieldErrors::new();
                errors.add("lime_image", "The lime image must be a base64 image data URL.");
                ApiError::Validation(errors)
            })?;
            let relative = format!("{}{stem}.{ext}", lime_folder(user.id));
            state.storage.put(&relative, &bytes).await?;
            Some(state.storage.url(&relative))
        }
        // References into this disk must point at the caller's own LIME images
        Some(raw)
            if state.storage.path_from_url(raw).is_some()
                && owned_lime_path(&state.storage, user.id, raw).is_none() =>
        {
            let mut errors = FieldErrors::new();
            errors.add("lime_image", "The lime image must reference one of your own explanation images.");
            return Err(ApiError::Validation(errors));
        }
        other => other.map(str::to_string),
    };

    let generated_at = db::now();
    let pdf = report::render(&ReportInput {
        user_name: &user.name,
        user_email: &user.email,
        filename: &input.filename,
        prediction: input.prediction,
        confidence: input.confidence,
        frames: input.frames,
        processing_time: input.processing_time,
        lime_image: lime_image.as_deref(),
        generated_at: &generated_at,
    })?;

    let pdf_path = format!("pdfs/{}/{stem}.pdf", user.id);
    state.storage.put(&pdf_path, &pdf).await?;

    let inserted = result::ActiveModel {
        user_id: Set(user.id),
        filename: Set(input.filename),
        prediction: Set(input.prediction),
        confidence: Set(input.confidence),
        frames: Set(input.frames),
        processing_time: Set(input.processing_time),
        pdf_path: Set(Some(pdf_path.clone())),
        lime_image: Set(lime_image),
        created_at: Set(generated_at.clone()),
        updated_at: Set(generated_at),
        ..Default::default()
    }
    .insert(&state.db)
    .await;

    let saved = match inserted {
        Ok(saved) => saved,
        Err(e) => {
            // Another result may share this report path; leave it alone
            let shared = result::Entity::find()
                .filter(result::Column::PdfPath.eq(pdf_path.as_str()))
                .count(&state.db)
                .await
                .unwrap_or(1);
            if shared == 0 {
                if let Err(cleanup) = state.storage.delete(&pdf_path).await {
                    tracing::warn!(user_id = user.id, %pdf_path, "Could not remove orphaned report: {cleanup}");
                }
            }
            return Err(e.into());
        }
    };

    tracing::info!(
        user_id = user.id,
        result_id = saved.id,
        prediction = saved.prediction.as_str(),
        "Analysis result saved"
    );

    Ok(Json(SavedResult {
        success: true,
        pdf_url: state.storage.url(&pdf_path),
        result: saved,
    }))
}
