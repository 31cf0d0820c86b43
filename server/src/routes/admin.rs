use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    response::Response,
    Json,
};
use sea_orm::sea_query::{Expr, Func, LikeExpr};
use sea_orm::*;

use crate::db;
use crate::entities::{result, session, user};
use crate::error::{ApiError, ApiResult};
use crate::extract::AdminUser;
use crate::models::{
    AdminProfile, HistoryEntry, ListUsersQuery, MessageResponse, Paginated, RoleUpdated,
    UpdateRoleRequest, UserDetail, UserDetailResponse, UserHistory, UserStats, UserSummary,
    UserWithCount,
};
use crate::permissions;
use crate::routes::results::{owned_result, pdf_download, remove_result_files};
use crate::state::AppState;
use crate::storage;

async fn find_user(db: &DatabaseConnection, id: i64) -> ApiResult<user::Model> {
    user::Entity::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".into()))
}

async fn count_results(db: &DatabaseConnection, user_id: i64) -> ApiResult<u64> {
    Ok(result::Entity::find()
        .filter(result::Column::UserId.eq(user_id))
        .count(db)
        .await?)
}

/// GET /api/admin/me
pub async fn me(AdminUser(admin): AdminUser) -> Json<AdminProfile> {
    Json(AdminProfile::from(&admin))
}

/// Escape LIKE wildcards so `term` only matches itself
fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Case-insensitive substring pattern for `lower(column) LIKE ...`
fn contains_pattern(term: &str) -> LikeExpr {
    LikeExpr::new(format!("%{}%", escape_like(&term.to_lowercase()))).escape('\\')
}

/// GET /api/admin/users?search=&page=&per_page=
pub async fn list_users(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Query(query): Query<ListUsersQuery>,
) -> ApiResult<Json<Paginated<UserWithCount>>> {
    let listing = query.validate().map_err(ApiError::Validation)?;

    let mut select = user::Entity::find().filter(user::Column::Id.ne(admin.id));

    if let Some(term) = &listing.search {
        let pattern = contains_pattern(term);
        select = select.filter(
            Condition::any()
                .add(Expr::expr(Func::lower(Expr::col(user::Column::Name))).like(pattern.clone()))
                .add(Expr::expr(Func::lower(Expr::col(user::Column::Email))).like(pattern)),
        );
    }

    let paginator = select
        .order_by_desc(user::Column::CreatedAt)
        .order_by_desc(user::Column::Id)
        .paginate(&state.db, listing.per_page);

    let total = paginator.num_items().await?;
    let users = paginator.fetch_page(listing.page - 1).await?;

    let mut data = Vec::with_capacity(users.len());
    for u in users {
        let results_count = count_results(&state.db, u.id).await?;
        data.push(UserWithCount {
            user: u.into(),
            results_count,
        });
    }

    Ok(Json(Paginated::new(data, listing.page, listing.per_page, total)))
}

/// GET /api/admin/users/{id}
pub async fn user_detail(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<UserDetailResponse>> {
    let target = find_user(&state.db, id).await?;

    let total_analysis = count_results(&state.db, target.id).await?;
    let last_analysis = result::Entity::find()
        .filter(result::Column::UserId.eq(target.id))
        .order_by_desc(result::Column::CreatedAt)
        .order_by_desc(result::Column::Id)
        .one(&state.db)
        .await?
        .map(|r| r.created_at);

    Ok(Json(UserDetailResponse {
        user: UserDetail {
            profile: AdminProfile::from(&target),
            stats: UserStats {
                total_analysis,
                last_analysis,
            },
        },
    }))
}

/// PATCH /api/admin/users/{id}/role
pub async fn update_role(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
    payload: Result<Json<UpdateRoleRequest>, JsonRejection>,
) -> ApiResult<Json<RoleUpdated>> {
    permissions::can_change_role(&admin, id).into_result()?;

    let Json(req) = payload?;
    let role = req.validate().map_err(ApiError::Validation)?;
    let target = find_user(&state.db, id).await?;

    let mut active: user::ActiveModel = target.into();
    active.role = Set(role);
    active.updated_at = Set(db::now());
    let updated = active.update(&state.db).await?;

    tracing::info!(admin_id = admin.id, user_id = updated.id, role = role.as_str(), "Role updated");

    Ok(Json(RoleUpdated {
        message: "Role updated successfully",
        user: UserSummary::from(&updated),
    }))
}

/// DELETE /api/admin/users/{id}: files first, then the account and everything it owns
pub async fn delete_user(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<MessageResponse>> {
    permissions::can_delete_user(&admin, id).into_result()?;

    let target = find_user(&state.db, id).await?;
    let owned = target.find_related(result::Entity).all(&state.db).await?;

    for row in &owned {
        remove_result_files(&state.db, &state.storage, row).await?;
    }
    state.storage.delete_dir(&format!("uploads/{}", target.id)).await?;
    state.storage.delete_dir(&format!("pdfs/{}", target.id)).await?;
    state.storage.delete_dir(&format!("lime/{}", target.id)).await?;
    if let Some(avatar) = target.avatar.as_deref().and_then(|u| state.storage.path_from_url(u)) {
        state.storage.delete(avatar).await?;
    }

    let txn = state.db.begin().await?;
    result::Entity::delete_many()
        .filter(result::Column::UserId.eq(target.id))
        .exec(&txn)
        .await?;
    session::Entity::delete_many()
        .filter(session::Column::UserId.eq(target.id))
        .exec(&txn)
        .await?;
    let deleted = user::Entity::delete_by_id(target.id).exec(&txn).await?;
    if deleted.rows_affected == 0 {
        return Err(ApiError::Unexpected(format!("User {} vanished during deletion", target.id)));
    }
    txn.commit().await?;

    tracing::info!(admin_id = admin.id, user_id = target.id, results = owned.len(), "User deleted");

    Ok(Json(MessageResponse {
        message: "User deleted successfully",
    }))
}

/// GET /api/admin/users/{id}/history
pub async fn user_history(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<UserHistory>> {
    let target = find_user(&state.db, id).await?;

    let history = target
        .find_related(result::Entity)
        .order_by_desc(result::Column::CreatedAt)
        .order_by_desc(result::Column::Id)
        .all(&state.db)
        .await?
        .into_iter()
        .map(HistoryEntry::from)
        .collect();

    Ok(Json(UserHistory {
        user: UserSummary::from(&target),
        history,
    }))
}

/// GET /api/admin/users/{id}/results/{result_id}/download
pub async fn download_user_result(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path((id, result_id)): Path<(i64, i64)>,
) -> ApiResult<Response> {
    let target = find_user(&state.db, id).await?;
    let row = owned_result(&state.db, target.id, result_id).await?;
    let download_name = format!("report_{}.pdf", storage::file_stem(&row.filename));
    pdf_download(&state.storage, row.pdf_path.as_deref(), &download_name).await
}
