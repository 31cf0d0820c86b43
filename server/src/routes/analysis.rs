use axum::{
    extract::{Multipart, State},
    Json,
};

use crate::analysis::Explanation;
use crate::error::{ApiError, ApiResult};
use crate::extract::AuthUser;
use crate::routes::media::MAX_MEDIA_SIZE;
use crate::state::AppState;
use crate::validation::FieldErrors;

/// POST /api/analyze-video: relay a file to the matching explain service
pub async fn analyze(
    State(state): State<AppState>,
    auth: AuthUser,
    mut multipart: Multipart,
) -> ApiResult<Json<Explanation>> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or("upload").to_string();
        let mime = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = field.bytes().await?;
        if data.is_empty() || data.len() > MAX_MEDIA_SIZE {
            break;
        }

        tracing::info!(user_id = auth.user.id, %file_name, %mime, "Analysis requested");
        let explanation = state.analysis.explain(&file_name, &mime, data.to_vec()).await?;
        return Ok(Json(explanation));
    }

    let mut errors = FieldErrors::new();
    errors.add("file", "The file field is required and may not be greater than 102400 kilobytes.");
    Err(ApiError::Validation(errors))
}
