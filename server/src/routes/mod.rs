pub mod admin;
pub mod analysis;
pub mod auth;
pub mod media;
pub mod profile;
pub mod results;

use axum::Json;
use serde_json::{json, Value};

/// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
