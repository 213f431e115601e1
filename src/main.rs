use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use tus_store::{
    config::AppConfig,
    routes,
    services::{
        chunk_store::{run_migrations, SqliteChunkStore},
        hooks::NoopHooks,
        sweeper,
    },
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("starting tus-store with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("created database directory at {}", parent.display());
        }
    }

    let connect_opts =
        SqliteConnectOptions::from_str(&cfg.database_url)?.create_if_missing(true);
    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(connect_opts)
        .await?;

    // --- Schema setup (idempotent); --migrate exits afterwards ---
    run_migrations(&db).await?;
    if migrate {
        tracing::info!("database migration complete");
        return Ok(());
    }

    // --- Initialize core service ---
    let store = Arc::new(SqliteChunkStore::new(
        db.clone(),
        cfg.chunk_size,
        cfg.max_size,
    ));
    let state = AppState::new(store.clone(), db, cfg.clone(), Arc::new(NoopHooks));

    // --- Background expiration sweep ---
    sweeper::spawn(
        store,
        Duration::from_secs(cfg.sweep_interval_secs),
        chrono::Duration::seconds(cfg.expiration_secs as i64),
    );

    // --- Build router ---
    let app = routes::routes::routes(state);

    // --- Start server ---
    let addr = cfg.addr();
    tracing::info!("server listening on http://{}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
