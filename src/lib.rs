pub mod ceremony;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::Database;
use crate::services::PendingLoginStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub pending: Arc<PendingLoginStore>,
}

pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Login routes carry their own proof (primary token or pending login
    // id); everything else requires an account token.
    let public_routes = Router::new()
        .route("/stepup/login/start", post(handlers::login::login_start))
        .route("/stepup/login/begin", post(handlers::login::login_begin))
        .route("/stepup/login/complete", post(handlers::login::login_complete))
        .route("/stepup/login/totp", post(handlers::login::verify_totp))
        .route("/stepup/login/backup", post(handlers::login::verify_backup));

    let protected_routes = Router::new()
        .route("/stepup/register/begin", post(handlers::enroll::register_begin))
        .route(
            "/stepup/register/complete",
            post(handlers::enroll::register_complete),
        )
        .route("/stepup/totp/begin", post(handlers::totp::totp_begin))
        .route("/stepup/totp/confirm", post(handlers::totp::totp_confirm))
        .route("/stepup/totp/disable", post(handlers::totp::totp_disable))
        .route("/stepup/backup", get(handlers::backup::backup_status))
        .route(
            "/stepup/backup/regenerate",
            post(handlers::backup::backup_regenerate),
        )
        .route("/stepup/devices", get(handlers::devices::list_devices))
        .route("/stepup/devices/:id", delete(handlers::devices::revoke_device))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    Router::new()
        .nest("/api/v1", public_routes.merge(protected_routes))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
