use axum::{extract::State, Json};

use crate::ceremony::{RequestOptions, UserVerification};
use crate::error::{ApiResponse, AppError, Result};
use crate::models::{
    ChallengePurpose, GrantResponse, LoginBeginRequest, LoginBeginResponse, LoginCompleteRequest,
    LoginStartRequest, LoginStartResponse, VerifyBackupRequest, VerifyTotpRequest,
    PURPOSE_PRIMARY,
};
use crate::services::{
    BackupCodeService, ChallengeService, DeviceService, LoginService, LoginState, PendingLogin,
    StartOutcome, TokenService, TotpService, VerifierService,
};
use crate::AppState;

/// Hand-off from the hosting platform after its primary credential
/// check. Creates the pending login, or grants outright when the account
/// has no enabled second factor.
/// POST /api/v1/stepup/login/start
pub async fn login_start(
    State(state): State<AppState>,
    Json(req): Json<LoginStartRequest>,
) -> Result<Json<ApiResponse<LoginStartResponse>>> {
    let claims = TokenService::validate(&req.primary_token, &state.config, PURPOSE_PRIMARY)?;

    let outcome =
        LoginService::start(&state.db, &state.pending, &state.config, &claims.sub).await?;

    let response = match outcome {
        StartOutcome::Granted { grant_token } => LoginStartResponse::Granted { grant_token },
        StartOutcome::Pending { pending, methods } => LoginStartResponse::SecondFactorRequired {
            pending_login_id: pending.id,
            methods,
        },
    };
    Ok(Json(ApiResponse::success(response)))
}

async fn pending_awaiting_second_factor(
    state: &AppState,
    pending_login_id: &str,
) -> Result<PendingLogin> {
    let pending = state.pending.get(pending_login_id).await?;
    if pending.state != LoginState::SecondFactorPending {
        return Err(AppError::Conflict(
            "Login attempt is not awaiting a second factor".to_string(),
        ));
    }
    Ok(pending)
}

/// Issue an authentication challenge for the pending login.
/// POST /api/v1/stepup/login/begin
pub async fn login_begin(
    State(state): State<AppState>,
    Json(req): Json<LoginBeginRequest>,
) -> Result<Json<ApiResponse<LoginBeginResponse>>> {
    let pending = pending_awaiting_second_factor(&state, &req.pending_login_id).await?;

    let allow = DeviceService::usable_credential_ids(&state.db, &pending.account_id).await?;
    if allow.is_empty() {
        return Err(AppError::BadRequest(
            "No enrolled device for this account".to_string(),
        ));
    }

    let challenge = ChallengeService::issue(
        &state.db,
        ChallengePurpose::Authenticate,
        Some(&pending.account_id),
        state.config.stepup.challenge_ttl_secs,
    )
    .await?;

    let rp = &state.config.relying_party;
    let options = RequestOptions {
        rp_id: rp.rp_id.clone(),
        origin: rp.rp_origin.clone(),
        challenge: challenge.nonce.clone(),
        allow_credentials: allow,
        user_verification: UserVerification::Preferred,
        timeout_ms: state.config.stepup.ceremony_timeout_ms,
    };

    Ok(Json(ApiResponse::success(LoginBeginResponse {
        challenge_id: challenge.id,
        options,
    })))
}

/// Verify the assertion and advance the login to a grant.
/// POST /api/v1/stepup/login/complete
pub async fn login_complete(
    State(state): State<AppState>,
    Json(req): Json<LoginCompleteRequest>,
) -> Result<Json<ApiResponse<GrantResponse>>> {
    let pending = pending_awaiting_second_factor(&state, &req.pending_login_id).await?;

    let credential = VerifierService::authenticate(
        &state.db,
        &state.config,
        &req.challenge_id,
        &req.credential,
    )
    .await?;
    if credential.account_id != pending.account_id {
        return Err(AppError::UnknownOrRevokedCredential);
    }

    let grant_token = LoginService::grant(&state.pending, &state.config, &pending.id).await?;
    Ok(Json(ApiResponse::success(GrantResponse {
        grant_token,
        backup_codes_remaining: None,
    })))
}

/// Verify a TOTP code for the pending login.
/// POST /api/v1/stepup/login/totp
pub async fn verify_totp(
    State(state): State<AppState>,
    Json(req): Json<VerifyTotpRequest>,
) -> Result<Json<ApiResponse<GrantResponse>>> {
    let pending = pending_awaiting_second_factor(&state, &req.pending_login_id).await?;

    TotpService::verify_code(&state.db, &state.config, &pending.account_id, &req.code).await?;

    let grant_token = LoginService::grant(&state.pending, &state.config, &pending.id).await?;
    Ok(Json(ApiResponse::success(GrantResponse {
        grant_token,
        backup_codes_remaining: None,
    })))
}

/// Spend a backup code for the pending login.
/// POST /api/v1/stepup/login/backup
pub async fn verify_backup(
    State(state): State<AppState>,
    Json(req): Json<VerifyBackupRequest>,
) -> Result<Json<ApiResponse<GrantResponse>>> {
    let pending = pending_awaiting_second_factor(&state, &req.pending_login_id).await?;

    let remaining =
        BackupCodeService::consume(&state.db, &pending.account_id, &req.code).await?;

    let grant_token = LoginService::grant(&state.pending, &state.config, &pending.id).await?;
    Ok(Json(ApiResponse::success(GrantResponse {
        grant_token,
        backup_codes_remaining: Some(remaining),
    })))
}
