use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edustep::config::Config;
use edustep::db::Database;
use edustep::services::{ChallengeService, PendingLoginStore};
use edustep::{create_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edustep=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting EduStep...");

    // Load configuration
    let config = Config::load()?;
    let config = Arc::new(config);
    tracing::info!("Configuration loaded");

    // Initialize database
    let db = Database::new(&config.database.path).await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    let pending = Arc::new(PendingLoginStore::new(
        config.stepup.pending_login_ttl_secs,
    ));

    let state = AppState {
        db: db.clone(),
        config: config.clone(),
        pending: pending.clone(),
    };

    // Background sweeper: storage hygiene for expired challenges and
    // abandoned pending logins. Correctness never depends on it.
    let sweep_interval = config.stepup.sweep_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(sweep_interval));
        loop {
            ticker.tick().await;
            match ChallengeService::sweep_expired(&db).await {
                Ok(0) => {}
                Ok(n) => tracing::debug!("swept {} expired challenges", n),
                Err(e) => tracing::warn!("challenge sweep failed: {}", e),
            }
            let dropped = pending.sweep().await;
            if dropped > 0 {
                tracing::debug!("swept {} expired pending logins", dropped);
            }
        }
    });

    // Build router
    let app = create_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
