use axum::{extract::State, Extension, Json};

use crate::error::{ApiResponse, Result};
use crate::models::{BackupRegenerateResponse, BackupStatusResponse, CurrentAccount};
use crate::services::{BackupCodeService, TokenService};
use crate::AppState;

/// How many unused backup codes remain.
/// GET /api/v1/stepup/backup
pub async fn backup_status(
    State(state): State<AppState>,
    Extension(account): Extension<CurrentAccount>,
) -> Result<Json<ApiResponse<BackupStatusResponse>>> {
    let remaining = BackupCodeService::remaining(&state.db, &account.id).await?;
    Ok(Json(ApiResponse::success(BackupStatusResponse { remaining })))
}

/// Reissue the batch, invalidating all previous codes. Reauth-gated like
/// every destructive factor change.
/// POST /api/v1/stepup/backup/regenerate
pub async fn backup_regenerate(
    State(state): State<AppState>,
    Extension(account): Extension<CurrentAccount>,
) -> Result<Json<ApiResponse<BackupRegenerateResponse>>> {
    TokenService::require_fresh_auth(&account, &state.config)?;
    let backup_codes = BackupCodeService::generate(
        &state.db,
        &account.id,
        state.config.stepup.backup_code_count,
        state.config.stepup.backup_code_length,
    )
    .await?;
    Ok(Json(ApiResponse::success(BackupRegenerateResponse {
        backup_codes,
    })))
}
