use anyhow::{Context, Result};
use gaefile::{
    config::AppConfig,
    routes::routes,
    services::{
        gateway::GatewayService,
        signing::SignerState,
        storage_service::{StorageService, run_migrations},
    },
};
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting gaefile with config: {:?}", cfg);
    if cfg.public_base_url.contains("127.0.0.1") || cfg.public_base_url.contains("[::1]") {
        tracing::warn!(
            "Signed URLs point at {}; set --public-base-url for remote clients",
            cfg.public_base_url
        );
    }

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    // Extract the local file path SQLx will use
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if !db_path.is_empty() && !db_path.starts_with(":memory:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .with_context(|| format!("connecting to {}", db_url))?,
    );

    run_migrations(&db).await?;
    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let storage = StorageService::new(db.clone(), cfg.storage_dir.clone());
    storage
        .ensure_bucket(&cfg.bucket)
        .await
        .with_context(|| format!("preparing bucket `{}`", cfg.bucket))?;
    let swept = storage.sweep_staging(&cfg.bucket).await?;
    if swept > 0 {
        tracing::info!("Removed {} abandoned staged uploads", swept);
    }

    let signer = SignerState::load(
        cfg.access_id_file.as_deref(),
        cfg.private_key_file.as_deref(),
        &cfg.public_base_url,
    );
    let gateway = GatewayService::new(storage, cfg.bucket.clone(), cfg.policy.clone(), signer);

    // --- Build router ---
    let app = routes::app(gateway);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
