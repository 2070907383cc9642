use axum::{extract::State, Extension, Json};

use crate::error::{ApiResponse, Result};
use crate::models::{
    CurrentAccount, TotpBeginResponse, TotpConfirmRequest, TotpConfirmResponse,
};
use crate::services::{TokenService, TotpService};
use crate::AppState;

/// Start TOTP enrollment; the secret stays disabled until confirmed.
/// POST /api/v1/stepup/totp/begin
pub async fn totp_begin(
    State(state): State<AppState>,
    Extension(account): Extension<CurrentAccount>,
) -> Result<Json<ApiResponse<TotpBeginResponse>>> {
    let (secret, otpauth_url) =
        TotpService::begin_enrollment(&state.db, &state.config, &account.id).await?;
    Ok(Json(ApiResponse::success(TotpBeginResponse {
        secret,
        otpauth_url,
    })))
}

/// Confirm enrollment with a current code. First-time enrollment also
/// emits the backup-code batch, disclosed exactly once.
/// POST /api/v1/stepup/totp/confirm
pub async fn totp_confirm(
    State(state): State<AppState>,
    Extension(account): Extension<CurrentAccount>,
    Json(req): Json<TotpConfirmRequest>,
) -> Result<Json<ApiResponse<TotpConfirmResponse>>> {
    let backup_codes =
        TotpService::confirm_enrollment(&state.db, &state.config, &account.id, &req.code).await?;

    Ok(Json(ApiResponse::success(TotpConfirmResponse {
        backup_codes,
    })))
}

/// Disable TOTP. Requires a primary re-authentication fresher than the
/// configured window, so a hijacked session cannot downgrade the account.
/// POST /api/v1/stepup/totp/disable
pub async fn totp_disable(
    State(state): State<AppState>,
    Extension(account): Extension<CurrentAccount>,
) -> Result<Json<ApiResponse<()>>> {
    TokenService::require_fresh_auth(&account, &state.config)?;
    TotpService::disable(&state.db, &account.id).await?;
    Ok(Json(ApiResponse::<()>::success_message(
        "Two-factor authentication disabled",
    )))
}
