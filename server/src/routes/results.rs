use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::*;

use crate::entities::result;
use crate::error::{ApiError, ApiResult};
use crate::extract::AuthUser;
use crate::models::DeletedResult;
use crate::routes::media::owned_lime_path;
use crate::state::AppState;
use crate::storage::Storage;

/// Results of `user_id`, newest first
pub async fn results_of(db: &DatabaseConnection, user_id: i64) -> ApiResult<Vec<result::Model>> {
    Ok(result::Entity::find()
        .filter(result::Column::UserId.eq(user_id))
        .order_by_desc(result::Column::CreatedAt)
        .order_by_desc(result::Column::Id)
        .all(db)
        .await?)
}

/// A result only if `user_id` owns it. Someone else's result is simply not found.
pub async fn owned_result(
    db: &DatabaseConnection,
    user_id: i64,
    result_id: i64,
) -> ApiResult<result::Model> {
    result::Entity::find_by_id(result_id)
        .filter(result::Column::UserId.eq(user_id))
        .one(db)
        .await?
        .ok_or_else(|| ApiError::NotFound("Result not found".into()))
}

/// Remove the files a result points at. Files already gone are fine.
///
/// A report shared with another row stays. Only LIME images inside the
/// owner's own `lime/` folder are touched.
pub async fn remove_result_files(
    db: &DatabaseConnection,
    storage: &Storage,
    row: &result::Model,
) -> ApiResult<()> {
    if let Some(pdf_path) = row.pdf_path.as_deref().filter(|p| !p.is_empty()) {
        let sharing = result::Entity::find()
            .filter(result::Column::PdfPath.eq(pdf_path))
            .filter(result::Column::Id.ne(row.id))
            .count(db)
            .await?;
        if sharing == 0 {
            let removed = storage.delete(pdf_path).await?;
            tracing::info!(result_id = row.id, pdf_path, removed, "Report file deletion");
        } else {
            tracing::info!(result_id = row.id, pdf_path, sharing, "Report still referenced; kept");
        }
    }
    if let Some(lime) = row
        .lime_image
        .as_deref()
        .and_then(|u| owned_lime_path(storage, row.user_id, u))
    {
        storage.delete(lime).await?;
    }
    Ok(())
}

/// Stream a stored report as a PDF attachment.
pub async fn pdf_download(
    storage: &Storage,
    pdf_path: Option<&str>,
    download_name: &str,
) -> ApiResult<Response> {
    let pdf_path = pdf_path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::NotFound("No report exists for this analysis".into()))?;

    let data = storage
        .get(pdf_path)
        .await?
        .ok_or_else(|| ApiError::NotFound("File not found in storage".into()))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{download_name}\""),
            ),
        ],
        Body::from(data),
    )
        .into_response())
}

// ─── Routes ───

/// GET /api/results
pub async fn list_results(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<Vec<result::Model>>> {
    Ok(Json(results_of(&state.db, auth.user.id).await?))
}

/// DELETE /api/results/{id}: report file first, then the row
pub async fn delete_result(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<DeletedResult>> {
    let row = owned_result(&state.db, auth.user.id, id).await?;

    tracing::info!(result_id = row.id, user_id = auth.user.id, "Deleting result");
    remove_result_files(&state.db, &state.storage, &row).await?;

    let deleted = result::Entity::delete_by_id(row.id).exec(&state.db).await?;
    if deleted.rows_affected == 0 {
        return Err(ApiError::Unexpected(format!("Result {} vanished during deletion", row.id)));
    }

    Ok(Json(DeletedResult {
        success: true,
        message: "Report and PDF deleted successfully",
    }))
}

/// GET /api/results/{id}/download
pub async fn download_result(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let row = owned_result(&state.db, auth.user.id, id).await?;
    pdf_download(&state.storage, row.pdf_path.as_deref(), &format!("report_{}.pdf", row.id)).await
}
