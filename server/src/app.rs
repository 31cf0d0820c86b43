use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Request, State},
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

use crate::error::ApiError;
use crate::routes;
use crate::routes::media::MAX_MEDIA_SIZE;
use crate::state::AppState;
use crate::storage::PUBLIC_PREFIX;

/// Room for multipart framing around the largest accepted file
const MAX_BODY_SIZE: usize = MAX_MEDIA_SIZE + 1024 * 1024;

pub fn build_router(state: AppState, allowed_origins: Vec<HeaderValue>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::CONTENT_DISPOSITION]);

    // Auth (rate limited per client IP)
    let public = Router::new()
        .route("/register", post(routes::auth::register))
        .route("/login", post(routes::auth::login))
        .route_layer(middleware::from_fn_with_state(state.clone(), limit_auth_requests));

    let api = Router::new()
        .merge(public)
        .route("/health", get(routes::health))
        // Session
        .route("/user", get(routes::auth::current_user))
        .route("/logout", post(routes::auth::logout))
        .route("/user/update", post(routes::profile::update_profile))
        // Media
        .route("/analyze-video", post(routes::analysis::analyze))
        .route("/videos/upload", post(routes::media::upload_media))
        .route("/videos/save-results", post(routes::media::save_results))
        // Results
        .route("/results", get(routes::results::list_results))
        .route("/results/{id}", delete(routes::results::delete_result))
        .route("/results/{id}/download", get(routes::results::download_result))
        // Admin
        .route("/admin/me", get(routes::admin::me))
        .route("/admin/users", get(routes::admin::list_users))
        .route(
            "/admin/users/{id}",
            get(routes::admin::user_detail).delete(routes::admin::delete_user),
        )
        .route("/admin/users/{id}/role", patch(routes::admin::update_role))
        .route("/admin/users/{id}/history", get(routes::admin::user_history))
        .route(
            "/admin/users/{id}/results/{result_id}/download",
            get(routes::admin::download_user_result),
        );

    let storage_root = state.storage.root().to_path_buf();

    Router::new()
        .nest("/api", api)
        .nest_service(PUBLIC_PREFIX, ServeDir::new(storage_root))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Peer address when served with connect info, else the first forwarded hop.
fn client_ip(req: &Request) -> String {
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn limit_auth_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let ip = client_ip(&req);
    if !state.auth_rate_limiter.check(&ip) {
        tracing::warn!(%ip, "Auth rate limit exceeded");
        return ApiError::TooManyRequests.into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use axum::body::{Body, Bytes};
    use axum::http::{HeaderMap, Request, StatusCode};
    use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, Set};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::analysis::AnalysisClient;
    use crate::db;
    use crate::entities::{result, session, user};
    use crate::storage::Storage;

    const BOUNDARY: &str = "deepscan-test-boundary";

    struct TestApp {
        router: Router,
        state: AppState,
        root: PathBuf,
    }

    impl Drop for TestApp {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    struct Reply {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    }

    impl Reply {
        fn json(&self) -> Value {
            serde_json::from_slice(&self.body).unwrap()
        }
    }

    async fn test_app() -> TestApp {
        test_app_with(AnalysisClient::new(None, None, Duration::from_secs(5)).unwrap()).await
    }

    async fn test_app_with(analysis: AnalysisClient) -> TestApp {
        let db = db::init_pool(db::IN_MEMORY).await.unwrap();
        let root = std::env::temp_dir().join(format!("deepscan-app-{}", uuid::Uuid::new_v4()));
        let state = AppState::new(
            db,
            "test-secret".to_string(),
            30,
            Storage::new(root.clone()),
            analysis,
            10,
        );
        let router = build_router(state.clone(), vec![HeaderValue::from_static("http://localhost:5173")]);
        TestApp { router, state, root }
    }

    impl TestApp {
        async fn send(&self, req: Request<Body>) -> Reply {
            let response = self.router.clone().oneshot(req).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            Reply { status, headers, body }
        }

        async fn json(&self, method: &str, uri: &str, token: Option<&str>, body: Value) -> Reply {
            let mut builder = Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json");
            if let Some(token) = token {
                builder = builder.header("authorization", format!("Bearer {token}"));
            }
            self.send(builder.body(Body::from(body.to_string())).unwrap()).await
        }

        async fn get(&self, uri: &str, token: Option<&str>) -> Reply {
            let mut builder = Request::builder().method("GET").uri(uri);
            if let Some(token) = token {
                builder = builder.header("authorization", format!("Bearer {token}"));
            }
            self.send(builder.body(Body::empty()).unwrap()).await
        }

        async fn delete(&self, uri: &str, token: &str) -> Reply {
            let req = Request::builder()
                .method("DELETE")
                .uri(uri)
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap();
            self.send(req).await
        }

        async fn multipart(&self, uri: &str, token: &str, parts: &[FormPart<'_>]) -> Reply {
            let req = Request::builder()
                .method("POST")
                .uri(uri)
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
                .body(Body::from(multipart_body(parts)))
                .unwrap();
            self.send(req).await
        }

        /// Register and return (user id, token)
        async fn register(&self, name: &str, email: &str) -> (i64, String) {
            let reply = self
                .json(
                    "POST",
                    "/api/register",
                    None,
                    json!({
                        "name": name,
                        "email": email,
                        "password": "secret1",
                        "password_confirmation": "secret1",
                    }),
                )
                .await;
            assert_eq!(reply.status, StatusCode::CREATED, "{:?}", reply.json());
            let json = reply.json();
            (
                json["user"]["id"].as_i64().unwrap(),
                json["token"].as_str().unwrap().to_string(),
            )
        }

        async fn set_role(&self, id: i64, role: user::Role) {
            let row = user::Entity::find_by_id(id).one(&self.state.db).await.unwrap().unwrap();
            let mut active: user::ActiveModel = row.into();
            active.role = Set(role);
            active.update(&self.state.db).await.unwrap();
        }

        async fn save_result(&self, token: &str, filename: &str) -> Reply {
            self.json(
                "POST",
                "/api/videos/save-results",
                Some(token),
                json!({
                    "filename": filename,
                    "prediction": "fake",
                    "confidence": 0.87,
                    "frames": 30,
                    "processing_time": 12.4,
                }),
            )
            .await
        }
    }

    enum FormPart<'a> {
        Text(&'a str, &'a str),
        File {
            name: &'a str,
            filename: &'a str,
            content_type: &'a str,
            data: &'a [u8],
        },
    }

    fn multipart_body(parts: &[FormPart<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                FormPart::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
                    );
                }
                FormPart::File { name, filename, content_type, data } => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(data);
                    body.extend_from_slice(b"\r\n");
                }
            }
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn video(filename: &str) -> FormPart<'_> {
        FormPart::File {
            name: "video",
            filename,
            content_type: "video/mp4",
            data: b"\x00\x00\x00\x18ftypmp42",
        }
    }

    // ─── Auth ───

    #[tokio::test]
    async fn test_register_then_login() {
        let app = test_app().await;
        let (id, token) = app.register("Alice", "Alice@Example.com").await;
        assert!(!token.is_empty());

        let stored = user::Entity::find_by_id(id).one(&app.state.db).await.unwrap().unwrap();
        assert_eq!(stored.email, "alice@example.com");
        assert_eq!(stored.role, user::Role::User);
        assert_ne!(stored.password_hash, "secret1");
        assert!(!stored.password_hash.contains("secret1"));

        let reply = app
            .json("POST", "/api/login", None, json!({"email": "alice@example.com", "password": "secret1"}))
            .await;
        assert_eq!(reply.status, StatusCode::OK);
        let json = reply.json();
        assert_eq!(json["user"]["email"], "alice@example.com");
        assert!(json["user"].get("password_hash").is_none());
        assert!(json["token"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_login_failures_are_indistinguishable() {
        let app = test_app().await;
        app.register("Alice", "alice@example.com").await;

        let wrong_password = app
            .json("POST", "/api/login", None, json!({"email": "alice@example.com", "password": "nope123"}))
            .await;
        let unknown_email = app
            .json("POST", "/api/login", None, json!({"email": "ghost@example.com", "password": "secret1"}))
            .await;

        assert_eq!(wrong_password.status, StatusCode::UNAUTHORIZED);
        assert_eq!(unknown_email.status, StatusCode::UNAUTHORIZED);
        assert_eq!(wrong_password.body, unknown_email.body);
        assert_eq!(wrong_password.json()["message"], "Invalid credentials");
    }

    #[tokio::test]
    async fn test_register_validation_and_duplicates() {
        let app = test_app().await;
        let reply = app
            .json(
                "POST",
                "/api/register",
                None,
                json!({"name": "", "email": "bad", "password": "123", "password_confirmation": "321"}),
            )
            .await;
        assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
        let errors = &reply.json()["errors"];
        assert!(errors["name"].is_array());
        assert!(errors["email"].is_array());
        assert!(errors["password"].is_array());

        app.register("Alice", "alice@example.com").await;
        let duplicate = app
            .json(
                "POST",
                "/api/register",
                None,
                json!({"name": "Other", "email": " ALICE@example.com ", "password": "secret1", "password_confirmation": "secret1"}),
            )
            .await;
        assert_eq!(duplicate.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(duplicate.json()["errors"]["email"][0], "The email has already been taken.");
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let app = test_app().await;
        let req = Request::builder()
            .method("POST")
            .uri("/api/login")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let reply = app.send(req).await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.json()["success"], false);
    }

    #[tokio::test]
    async fn test_current_user_and_logout() {
        let app = test_app().await;
        assert_eq!(app.get("/api/user", None).await.status, StatusCode::UNAUTHORIZED);
        assert_eq!(app.get("/api/user", Some("garbage")).await.status, StatusCode::UNAUTHORIZED);

        let (id, token) = app.register("Alice", "alice@example.com").await;
        let me = app.get("/api/user", Some(&token)).await;
        assert_eq!(me.status, StatusCode::OK);
        assert_eq!(me.json()["id"], id);

        let out = app.json("POST", "/api/logout", Some(&token), json!({})).await;
        assert_eq!(out.status, StatusCode::OK);
        assert_eq!(out.json()["message"], "Logged out successfully");

        let after = app.get("/api/user", Some(&token)).await;
        assert_eq!(after.status, StatusCode::UNAUTHORIZED);
        assert_eq!(after.json()["message"], "Unauthenticated.");
    }

    #[tokio::test]
    async fn test_auth_endpoints_are_rate_limited() {
        let app = test_app().await;
        let mut last = StatusCode::OK;
        for _ in 0..11 {
            last = app
                .json("POST", "/api/login", None, json!({"email": "x@example.com", "password": "whatever"}))
                .await
                .status;
        }
        assert_eq!(last, StatusCode::TOO_MANY_REQUESTS);
    }

    // ─── Media and results ───

    #[tokio::test]
    async fn test_full_analysis_flow() {
        let app = test_app().await;
        let (_, token) = app.register("Alice", "alice@example.com").await;

        let upload = app.multipart("/api/videos/upload", &token, &[video("clip.mp4")]).await;
        assert_eq!(upload.status, StatusCode::OK, "{:?}", upload.json());
        let stored = upload.json();
        assert_eq!(stored["filename"], "alice_001.mp4");
        assert!(stored["url"].as_str().unwrap().starts_with("/storage/uploads/"));

        let second = app.multipart("/api/videos/upload", &token, &[video("other.mp4")]).await;
        assert_eq!(second.json()["filename"], "alice_002.mp4");

        let saved = app.save_result(&token, "alice_001.mp4").await;
        assert_eq!(saved.status, StatusCode::OK, "{:?}", saved.json());
        let saved = saved.json();
        assert_eq!(saved["success"], true);
        assert_eq!(saved["result"]["prediction"], "FAKE");
        assert!(saved["pdf_url"].as_str().unwrap().ends_with("/alice_001.pdf"));
        let id = saved["result"]["id"].as_i64().unwrap();

        let list = app.get("/api/results", Some(&token)).await;
        assert_eq!(list.status, StatusCode::OK);
        let list = list.json();
        let rows = list.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["prediction"], "FAKE");
        assert_eq!(rows[0]["confidence"].as_f64(), Some(0.87));
        assert_eq!(rows[0]["frames"], 30);
        assert_eq!(rows[0]["processing_time"].as_f64(), Some(12.4));

        let download = app.get(&format!("/api/results/{id}/download"), Some(&token)).await;
        assert_eq!(download.status, StatusCode::OK);
        assert_eq!(download.headers["content-type"], "application/pdf");
        let disposition = download.headers["content-disposition"].to_str().unwrap();
        assert!(disposition.contains(&format!("report_{id}.pdf")));
        assert!(download.body.starts_with(b"%PDF-"));
    }

    #[tokio::test]
    async fn test_results_list_newest_first() {
        let app = test_app().await;
        let (_, token) = app.register("Alice", "alice@example.com").await;
        app.save_result(&token, "first.mp4").await;
        app.save_result(&token, "second.mp4").await;

        let list = app.get("/api/results", Some(&token)).await.json();
        let names: Vec<&str> = list
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["filename"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["second.mp4", "first.mp4"]);
    }

    #[tokio::test]
    async fn test_upload_rejects_disallowed_types() {
        let app = test_app().await;
        let (_, token) = app.register("Alice", "alice@example.com").await;

        let exe = FormPart::File {
            name: "video",
            filename: "tool.exe",
            content_type: "application/x-msdownload",
            data: b"MZ",
        };
        let reply = app.multipart("/api/videos/upload", &token, &[exe]).await;
        assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(reply.json()["errors"]["video"].is_array());

        let missing = app.multipart("/api/videos/upload", &token, &[FormPart::Text("note", "hi")]).await;
        assert_eq!(missing.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_save_result_rejects_out_of_range_values() {
        let app = test_app().await;
        let (_, token) = app.register("Alice", "alice@example.com").await;

        let reply = app
            .json(
                "POST",
                "/api/videos/save-results",
                Some(&token),
                json!({"filename": "a.mp4", "prediction": "MAYBE", "confidence": 1.5, "frames": 0, "processing_time": -2}),
            )
            .await;
        assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
        let errors = &reply.json()["errors"];
        for field in ["prediction", "confidence", "frames", "processing_time"] {
            assert!(errors[field].is_array(), "missing error for {field}");
        }

        let count = result::Entity::find().count(&app.state.db).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_inline_lime_image_is_stored() {
        let app = test_app().await;
        let (_, token) = app.register("Alice", "alice@example.com").await;
        let reply = app
            .json(
                "POST",
                "/api/videos/save-results",
                Some(&token),
                json!({
                    "filename": "clip.mp4",
                    "prediction": "REAL",
                    "confidence": 0.2,
                    "frames": 5,
                    "processing_time": 1.0,
                    "lime_image": "data:image/png;base64,iVBORw0KGgo=",
                }),
            )
            .await;
        assert_eq!(reply.status, StatusCode::OK);
        let lime = reply.json()["result"]["lime_image"].as_str().unwrap().to_string();
        assert!(lime.starts_with("/storage/lime/"));
        let relative = app.state.storage.path_from_url(&lime).unwrap();
        assert!(app.state.storage.exists(relative).await.unwrap());
    }

    #[tokio::test]
    async fn test_results_are_owner_scoped() {
        let app = test_app().await;
        let (_, alice) = app.register("Alice", "alice@example.com").await;
        let (_, bob) = app.register("Bob", "bob@example.com").await;

        let id = app.save_result(&alice, "clip.mp4").await.json()["result"]["id"].as_i64().unwrap();

        let download = app.get(&format!("/api/results/{id}/download"), Some(&bob)).await;
        assert_eq!(download.status, StatusCode::NOT_FOUND);
        assert!(!download.body.starts_with(b"%PDF"));

        assert_eq!(app.delete(&format!("/api/results/{id}"), &bob).await.status, StatusCode::NOT_FOUND);
        assert!(app.get("/api/results", Some(&bob)).await.json().as_array().unwrap().is_empty());

        // Still there for the owner
        assert_eq!(app.get("/api/results", Some(&alice)).await.json().as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_result_removes_file_and_row() {
        let app = test_app().await;
        let (_, token) = app.register("Alice", "alice@example.com").await;
        let saved = app.save_result(&token, "clip.mp4").await.json();
        let id = saved["result"]["id"].as_i64().unwrap();
        let pdf_path = saved["result"]["pdf_path"].as_str().unwrap().to_string();
        assert!(app.state.storage.exists(&pdf_path).await.unwrap());

        let reply = app.delete(&format!("/api/results/{id}"), &token).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.json()["success"], true);
        assert!(!app.state.storage.exists(&pdf_path).await.unwrap());
        assert!(result::Entity::find_by_id(id).one(&app.state.db).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_report_but_download_does_not() {
        let app = test_app().await;
        let (_, token) = app.register("Alice", "alice@example.com").await;
        let saved = app.save_result(&token, "clip.mp4").await.json();
        let id = saved["result"]["id"].as_i64().unwrap();
        let pdf_path = saved["result"]["pdf_path"].as_str().unwrap().to_string();
        app.state.storage.delete(&pdf_path).await.unwrap();

        let download = app.get(&format!("/api/results/{id}/download"), Some(&token)).await;
        assert_eq!(download.status, StatusCode::NOT_FOUND);
        assert_eq!(download.json()["message"], "File not found in storage");

        assert_eq!(app.delete(&format!("/api/results/{id}"), &token).await.status, StatusCode::OK);
    }

    // ─── Profile ───

    #[tokio::test]
    async fn test_profile_update_with_avatar() {
        let app = test_app().await;
        let (_, token) = app.register("Alice", "alice@example.com").await;
        app.register("Bob", "bob@example.com").await;

        let taken = app
            .multipart("/api/user/update", &token, &[FormPart::Text("email", "bob@example.com")])
            .await;
        assert_eq!(taken.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(taken.json()["errors"]["email"].is_array());

        // Keeping one's own email is fine
        let reply = app
            .multipart(
                "/api/user/update",
                &token,
                &[
                    FormPart::Text("name", "Alice Smith"),
                    FormPart::Text("email", "alice@example.com"),
                    FormPart::Text("phone", "+15550100"),
                    FormPart::Text("bio", ""),
                    FormPart::File {
                        name: "avatar",
                        filename: "me.png",
                        content_type: "image/png",
                        data: b"\x89PNG\r\n\x1a\n",
                    },
                ],
            )
            .await;
        assert_eq!(reply.status, StatusCode::OK, "{:?}", reply.json());
        let user = &reply.json()["user"];
        assert_eq!(user["name"], "Alice Smith");
        assert_eq!(user["phone"], "+15550100");
        assert!(user["bio"].is_null());
        let avatar = user["avatar"].as_str().unwrap().to_string();
        assert!(avatar.starts_with("/storage/avatars/"));
        let relative = app.state.storage.path_from_url(&avatar).unwrap();
        assert!(app.state.storage.exists(relative).await.unwrap());

        let too_long = app
            .multipart("/api/user/update", &token, &[FormPart::Text("phone", "1234567890123456")])
            .await;
        assert_eq!(too_long.status, StatusCode::UNPROCESSABLE_ENTITY);

        let not_image = app
            .multipart(
                "/api/user/update",
                &token,
                &[FormPart::File { name: "avatar", filename: "a.pdf", content_type: "application/pdf", data: b"%PDF" }],
            )
            .await;
        assert_eq!(not_image.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    // ─── Admin ───

    #[tokio::test]
    async fn test_admin_routes_require_admin_role() {
        let app = test_app().await;
        let (_, token) = app.register("Alice", "alice@example.com").await;
        assert_eq!(app.get("/api/admin/users", None).await.status, StatusCode::UNAUTHORIZED);
        let reply = app.get("/api/admin/users", Some(&token)).await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        assert_eq!(reply.json()["message"], "Unauthorized. Admin access required.");

        // Gate runs before anything else, even for unknown targets
        assert_eq!(app.delete("/api/admin/users/999", &token).await.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_cannot_target_self() {
        let app = test_app().await;
        let (admin_id, admin) = app.register("Root", "root@example.com").await;
        app.set_role(admin_id, user::Role::Admin).await;

        let demote = app
            .json("PATCH", &format!("/api/admin/users/{admin_id}/role"), Some(&admin), json!({"role": "user"}))
            .await;
        assert_eq!(demote.status, StatusCode::FORBIDDEN);
        assert_eq!(demote.json()["message"], "Cannot modify your own role");

        let delete = app.delete(&format!("/api/admin/users/{admin_id}"), &admin).await;
        assert_eq!(delete.status, StatusCode::FORBIDDEN);
        assert_eq!(delete.json()["message"], "Cannot delete yourself");

        let still = user::Entity::find_by_id(admin_id).one(&app.state.db).await.unwrap().unwrap();
        assert_eq!(still.role, user::Role::Admin);
    }

    #[tokio::test]
    async fn test_role_promotion_grants_admin_access() {
        let app = test_app().await;
        let (admin_id, admin) = app.register("Root", "root@example.com").await;
        app.set_role(admin_id, user::Role::Admin).await;
        let (bob_id, bob) = app.register("Bob", "bob@example.com").await;

        assert_eq!(app.get("/api/admin/me", Some(&bob)).await.status, StatusCode::FORBIDDEN);

        let invalid = app
            .json("PATCH", &format!("/api/admin/users/{bob_id}/role"), Some(&admin), json!({"role": "root"}))
            .await;
        assert_eq!(invalid.status, StatusCode::UNPROCESSABLE_ENTITY);

        let promote = app
            .json("PATCH", &format!("/api/admin/users/{bob_id}/role"), Some(&admin), json!({"role": "admin"}))
            .await;
        assert_eq!(promote.status, StatusCode::OK);
        assert_eq!(promote.json()["user"]["role"], "admin");

        let listing = app.get("/api/admin/users", Some(&admin)).await.json();
        let bob_row = listing["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|u| u["id"] == bob_id)
            .unwrap()
            .clone();
        assert_eq!(bob_row["role"], "admin");

        // Same token, new role: no re-login needed
        let me = app.get("/api/admin/me", Some(&bob)).await;
        assert_eq!(me.status, StatusCode::OK);
        assert_eq!(me.json()["email"], "bob@example.com");
    }

    #[tokio::test]
    async fn test_admin_listing_search_and_pagination() {
        let app = test_app().await;
        let (admin_id, admin) = app.register("Root", "root@example.com").await;
        app.set_role(admin_id, user::Role::Admin).await;
        let (_, alice) = app.register("Alice Liddell", "alice@example.com").await;
        app.register("Bob", "bob@wonder.org").await;
        app.register("Carol", "carol@example.com").await;
        app.save_result(&alice, "one.mp4").await;
        app.save_result(&alice, "two.mp4").await;

        let all = app.get("/api/admin/users", Some(&admin)).await.json();
        assert_eq!(all["total"], 3);
        let names: Vec<&str> = all["data"].as_array().unwrap().iter().map(|u| u["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Carol", "Bob", "Alice Liddell"]);
        assert!(all["data"].as_array().unwrap().iter().all(|u| u["id"] != admin_id));
        assert_eq!(all["data"][2]["results_count"], 2);
        assert!(all["data"][0].get("password_hash").is_none());

        let by_name = app.get("/api/admin/users?search=LIDDELL", Some(&admin)).await.json();
        assert_eq!(by_name["total"], 1);
        assert_eq!(by_name["data"][0]["email"], "alice@example.com");

        let by_email = app.get("/api/admin/users?search=wonder", Some(&admin)).await.json();
        assert_eq!(by_email["data"][0]["name"], "Bob");

        let paged = app.get("/api/admin/users?per_page=2&page=2", Some(&admin)).await.json();
        assert_eq!(paged["current_page"], 2);
        assert_eq!(paged["last_page"], 2);
        assert_eq!(paged["data"].as_array().unwrap().len(), 1);

        // Wildcards match only themselves
        let underscore = app.get("/api/admin/users?search=_", Some(&admin)).await.json();
        assert_eq!(underscore["total"], 0);
        let percent = app.get("/api/admin/users?search=%25", Some(&admin)).await.json();
        assert_eq!(percent["total"], 0);

        let bad = app.get("/api/admin/users?per_page=500", Some(&admin)).await;
        assert_eq!(bad.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_admin_detail_history_and_download() {
        let app = test_app().await;
        let (admin_id, admin) = app.register("Root", "root@example.com").await;
        app.set_role(admin_id, user::Role::Admin).await;
        let (alice_id, alice) = app.register("Alice", "alice@example.com").await;
        let (bob_id, _) = app.register("Bob", "bob@example.com").await;

        app.save_result(&alice, "older.mp4").await;
        let newest = app.save_result(&alice, "newer.mp4").await.json();
        let newest_id = newest["result"]["id"].as_i64().unwrap();

        let detail = app.get(&format!("/api/admin/users/{alice_id}"), Some(&admin)).await.json();
        assert_eq!(detail["user"]["stats"]["total_analysis"], 2);
        assert_eq!(detail["user"]["stats"]["last_analysis"], newest["result"]["created_at"]);

        let empty = app.get(&format!("/api/admin/users/{bob_id}"), Some(&admin)).await.json();
        assert_eq!(empty["user"]["stats"]["total_analysis"], 0);
        assert!(empty["user"]["stats"]["last_analysis"].is_null());

        assert_eq!(app.get("/api/admin/users/9999", Some(&admin)).await.status, StatusCode::NOT_FOUND);

        let history = app.get(&format!("/api/admin/users/{alice_id}/history"), Some(&admin)).await.json();
        assert_eq!(history["user"]["email"], "alice@example.com");
        let entries = history["history"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["filename"], "newer.mp4");
        assert!(entries[0].get("user_id").is_none());
        assert!(entries[0]["pdf_path"].is_string());

        let download = app
            .get(&format!("/api/admin/users/{alice_id}/results/{newest_id}/download"), Some(&admin))
            .await;
        assert_eq!(download.status, StatusCode::OK);
        assert!(download.headers["content-disposition"].to_str().unwrap().contains("report_newer.pdf"));
        assert!(download.body.starts_with(b"%PDF-"));

        // Result exists, but not under that user
        let wrong_owner = app
            .get(&format!("/api/admin/users/{bob_id}/results/{newest_id}/download"), Some(&admin))
            .await;
        assert_eq!(wrong_owner.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_delete_user_cascades() {
        let app = test_app().await;
        let (admin_id, admin) = app.register("Root", "root@example.com").await;
        app.set_role(admin_id, user::Role::Admin).await;
        let (alice_id, alice) = app.register("Alice", "alice@example.com").await;

        app.multipart("/api/videos/upload", &alice, &[video("clip.mp4")]).await;
        let first = app.save_result(&alice, "one.mp4").await.json();
        let second = app.save_result(&alice, "two.mp4").await.json();
        let pdfs: Vec<String> = [&first, &second]
            .iter()
            .map(|s| s["result"]["pdf_path"].as_str().unwrap().to_string())
            .collect();
        // One report already gone; deletion must still succeed
        app.state.storage.delete(&pdfs[0]).await.unwrap();

        let reply = app.delete(&format!("/api/admin/users/{alice_id}"), &admin).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.json()["message"], "User deleted successfully");

        for pdf in &pdfs {
            assert!(!app.state.storage.exists(pdf).await.unwrap());
        }
        assert!(app.state.storage.files(&format!("uploads/{alice_id}")).await.unwrap().is_empty());

        let remaining = result::Entity::find()
            .filter(result::Column::UserId.eq(alice_id))
            .count(&app.state.db)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
        let sessions = session::Entity::find()
            .filter(session::Column::UserId.eq(alice_id))
            .count(&app.state.db)
            .await
            .unwrap();
        assert_eq!(sessions, 0);

        assert_eq!(app.get("/api/user", Some(&alice)).await.status, StatusCode::UNAUTHORIZED);
        let listing = app.get("/api/admin/users", Some(&admin)).await.json();
        assert_eq!(listing["total"], 0);
    }

    #[tokio::test]
    async fn test_admin_search_treats_underscore_literally() {
        let app = test_app().await;
        let (admin_id, admin) = app.register("Root", "root@example.com").await;
        app.set_role(admin_id, user::Role::Admin).await;
        app.register("Snake", "snake_case@example.com").await;
        app.register("Camel", "camelcase@example.com").await;

        let listing = app.get("/api/admin/users?search=e_c", Some(&admin)).await.json();
        assert_eq!(listing["total"], 1);
        assert_eq!(listing["data"][0]["name"], "Snake");

        let underscore = app.get("/api/admin/users?search=_", Some(&admin)).await.json();
        assert_eq!(underscore["total"], 1);
    }

    // ─── Stored file ownership ───

    #[tokio::test]
    async fn test_lime_reference_to_foreign_file_is_rejected() {
        let app = test_app().await;
        let (alice_id, alice) = app.register("Alice", "alice@example.com").await;
        let (_, bob) = app.register("Bob", "bob@example.com").await;
        let alice_pdf = app.save_result(&alice, "clip.mp4").await.json()["result"]["pdf_path"]
            .as_str()
            .unwrap()
            .to_string();

        for target in [format!("/storage/{alice_pdf}"), format!("/storage/lime/{alice_id}/clip.png")] {
            let reply = app
                .json(
                    "POST",
                    "/api/videos/save-results",
                    Some(&bob),
                    json!({
                        "filename": "mine.mp4",
                        "prediction": "REAL",
                        "confidence": 0.1,
                        "frames": 1,
                        "processing_time": 0.5,
                        "lime_image": target,
                    }),
                )
                .await;
            assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
            assert!(reply.json()["errors"]["lime_image"].is_array());
        }

        // External references are kept as given
        let external = app
            .json(
                "POST",
                "/api/videos/save-results",
                Some(&bob),
                json!({
                    "filename": "mine.mp4",
                    "prediction": "REAL",
                    "confidence": 0.1,
                    "frames": 1,
                    "processing_time": 0.5,
                    "lime_image": "https://explain.example.com/lime/1.png",
                }),
            )
            .await;
        assert_eq!(external.status, StatusCode::OK);
        assert_eq!(external.json()["result"]["lime_image"], "https://explain.example.com/lime/1.png");

        assert!(app.state.storage.exists(&alice_pdf).await.unwrap());
    }

    #[tokio::test]
    async fn test_deleting_result_never_touches_other_users_files() {
        let app = test_app().await;
        let (_, alice) = app.register("Alice", "alice@example.com").await;
        let (bob_id, bob) = app.register("Bob", "bob@example.com").await;
        let alice_saved = app.save_result(&alice, "clip.mp4").await.json();
        let alice_id = alice_saved["result"]["id"].as_i64().unwrap();
        let alice_pdf = alice_saved["result"]["pdf_path"].as_str().unwrap().to_string();

        // A row pointing outside its owner's LIME folder, as older data might
        let now = db::now();
        let planted = result::ActiveModel {
            user_id: Set(bob_id),
            filename: Set("mine.mp4".to_string()),
            prediction: Set(result::Prediction::Real),
            confidence: Set(0.1),
            frames: Set(1),
            processing_time: Set(0.5),
            pdf_path: Set(None),
            lime_image: Set(Some(format!("/storage/{alice_pdf}"))),
            created_at: Set(now.clone()),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&app.state.db)
        .await
        .unwrap();

        let reply = app.delete(&format!("/api/results/{}", planted.id), &bob).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert!(app.state.storage.exists(&alice_pdf).await.unwrap());

        let download = app.get(&format!("/api/results/{alice_id}/download"), Some(&alice)).await;
        assert_eq!(download.status, StatusCode::OK);
        assert!(download.body.starts_with(b"%PDF-"));
    }

    #[tokio::test]
    async fn test_shared_report_survives_deleting_one_result() {
        let app = test_app().await;
        let (_, token) = app.register("Alice", "alice@example.com").await;
        let first = app.save_result(&token, "clip.mp4").await.json();
        let second = app.save_result(&token, "clip.mp4").await.json();
        let first_id = first["result"]["id"].as_i64().unwrap();
        let second_id = second["result"]["id"].as_i64().unwrap();
        let pdf_path = first["result"]["pdf_path"].as_str().unwrap().to_string();
        assert_eq!(second["result"]["pdf_path"], first["result"]["pdf_path"]);

        assert_eq!(app.delete(&format!("/api/results/{second_id}"), &token).await.status, StatusCode::OK);
        assert!(app.state.storage.exists(&pdf_path).await.unwrap());
        let download = app.get(&format!("/api/results/{first_id}/download"), Some(&token)).await;
        assert_eq!(download.status, StatusCode::OK);

        // Last reference gone: file goes too
        assert_eq!(app.delete(&format!("/api/results/{first_id}"), &token).await.status, StatusCode::OK);
        assert!(!app.state.storage.exists(&pdf_path).await.unwrap());
    }

    // ─── Misc ───

    async fn explain_service(handler: axum::routing::MethodRouter) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = Router::new().route("/explain", handler);
        tokio::spawn(async move {
            axum::serve(listener, service).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_analysis_relays_to_configured_service() {
        let image = explain_service(post(|| async {
            axum::Json(json!({"label": "real", "confidence": 0.12}))
        }))
        .await;
        let video = explain_service(post(|| async {
            (StatusCode::INTERNAL_SERVER_ERROR, "out of memory")
        }))
        .await;
        let analysis = AnalysisClient::new(Some(image), Some(video), Duration::from_secs(5)).unwrap();
        let app = test_app_with(analysis).await;
        let (_, token) = app.register("Alice", "alice@example.com").await;

        let photo = FormPart::File {
            name: "file",
            filename: "face.jpg",
            content_type: "image/jpeg",
            data: b"\xff\xd8\xff",
        };
        let reply = app.multipart("/api/analyze-video", &token, &[photo]).await;
        assert_eq!(reply.status, StatusCode::OK);
        let json = reply.json();
        assert_eq!(json["label"], "REAL");
        assert_eq!(json["confidence"].as_f64(), Some(0.12));

        let reply = app.multipart("/api/analyze-video", &token, &[FormPart::File {
            name: "file",
            filename: "clip.mp4",
            content_type: "video/mp4",
            data: b"ftyp",
        }]).await;
        assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
        assert_eq!(reply.json()["message"], "Analysis service failed");
    }


    #[tokio::test]
    async fn test_analysis_without_services_is_unavailable() {
        let app = test_app().await;
        let (_, token) = app.register("Alice", "alice@example.com").await;
        let file = FormPart::File {
            name: "file",
            filename: "face.jpg",
            content_type: "image/jpeg",
            data: b"\xff\xd8\xff",
        };
        let reply = app.multipart("/api/analyze-video", &token, &[file]).await;
        assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);

        let missing = app.multipart("/api/analyze-video", &token, &[FormPart::Text("x", "y")]).await;
        assert_eq!(missing.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_uploaded_media_is_served_publicly() {
        let app = test_app().await;
        let (_, token) = app.register("Alice", "alice@example.com").await;
        let url = app.multipart("/api/videos/upload", &token, &[video("clip.mp4")]).await.json()["url"]
            .as_str()
            .unwrap()
            .to_string();
        let served = app.get(&url, None).await;
        assert_eq!(served.status, StatusCode::OK);
        assert!(served.body.ends_with(b"ftypmp42"));
    }

    #[tokio::test]
    async fn test_health_and_cors() {
        let app = test_app().await;
        let req = Request::builder()
            .uri("/api/health")
            .header("origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let reply = app.send(req).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.json()["status"], "ok");
        assert_eq!(reply.headers["access-control-allow-origin"], "http://localhost:5173");

        let foreign = Request::builder()
            .uri("/api/health")
            .header("origin", "http://evil.example")
            .body(Body::empty())
            .unwrap();
        let reply = app.send(foreign).await;
        assert!(reply.headers.get("access-control-allow-origin").is_none());
    }
}
