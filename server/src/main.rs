mod analysis;
mod app;
mod db;
mod entities;
mod error;
mod extract;
mod models;
mod permissions;
mod report;
mod routes;
mod state;
mod storage;
mod token;
mod validation;

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::HeaderValue;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use analysis::AnalysisClient;
use state::AppState;
use storage::Storage;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// Database path (":memory:" for a throwaway database)
    #[arg(short, long, env = "DATABASE_PATH", default_value = "deepscan.db")]
    db_path: String,

    /// Root of the public disk (uploads, avatars, reports)
    #[arg(long, env = "STORAGE_DIR", default_value = "./storage")]
    storage_dir: String,

    /// Origins allowed to call the API from a browser
    #[arg(
        long,
        env = "ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:5173,http://127.0.0.1:5173"
    )]
    allowed_origins: Vec<String>,

    /// Base URL of the image explain service
    #[arg(long, env = "IMAGE_SERVICE_URL")]
    image_service_url: Option<String>,

    /// Base URL of the video explain service
    #[arg(long, env = "VIDEO_SERVICE_URL")]
    video_service_url: Option<String>,

    /// Seconds to wait on an explain service
    #[arg(long, env = "ANALYSIS_TIMEOUT_SECS", default_value_t = 300)]
    analysis_timeout_secs: u64,

    /// Lifetime of issued tokens, in days
    #[arg(long, env = "TOKEN_TTL_DAYS", default_value_t = 30)]
    token_ttl_days: i64,

    /// Register/login requests allowed per IP per minute
    #[arg(long, env = "AUTH_RATE_LIMIT", default_value_t = 10)]
    auth_rate_limit: u32,

    /// Admin email for first run
    #[arg(long, env = "ADMIN_EMAIL")]
    admin_email: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .init();

    let args = Args::parse();

    // JWT secret: from env, from file, or generate and save to file
    let jwt_secret = match std::env::var("JWT_SECRET") {
        Ok(secret) if !secret.trim().is_empty() => secret,
        _ => token::load_or_create_secret(std::path::Path::new("jwt_secret.key")),
    };

    tokio::fs::create_dir_all(&args.storage_dir).await?;

    tracing::info!("Initializing database at {}", args.db_path);
    let db = db::init_pool(&args.db_path).await?;

    // --- First-run admin ---
    if let Some(email) = &args.admin_email {
        if let Some(temp_password) = routes::auth::bootstrap_admin(&db, email).await? {
            println!();
            println!("  ╔══════════════════════════════════════════════╗");
            println!("  ║          FIRST-RUN ADMIN CREATED!            ║");
            println!("  ╠══════════════════════════════════════════════╣");
            println!("  ║  Email:    {:<34}║", email);
            println!("  ║  Password: {:<34}║", temp_password);
            println!("  ╠══════════════════════════════════════════════╣");
            println!("  ║  PLEASE SAVE THESE CREDENTIALS NOW!          ║");
            println!("  ╚══════════════════════════════════════════════╝");
            println!();
        }
    }

    if args.image_service_url.is_none() || args.video_service_url.is_none() {
        tracing::warn!("An explain service URL is not configured; matching analyses will return 503");
    }
    let analysis = AnalysisClient::new(
        args.image_service_url,
        args.video_service_url,
        Duration::from_secs(args.analysis_timeout_secs),
    )?;

    let state = AppState::new(
        db,
        jwt_secret,
        args.token_ttl_days,
        Storage::new(&args.storage_dir),
        analysis,
        args.auth_rate_limit,
    );

    // Rate limiter cleanup
    let limiter = state.auth_rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            limiter.cleanup();
            tracing::debug!(tracked = limiter.tracked(), "Rate limiter cleaned up");
        }
    });

    let origins: Vec<HeaderValue> = args
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "Ignoring invalid allowed origin");
                None
            }
        })
        .collect();

    let app = app::build_router(state, origins);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    println!();
    println!("  ╔══════════════════════════════════════════════╗");
    println!("  ║          DeepScan Server v0.1.0              ║");
    println!("  ╠══════════════════════════════════════════════╣");
    println!("  ║  Running on: http://localhost:{:<14}║", args.port);
    println!("  ╚══════════════════════════════════════════════╝");
    println!();

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
