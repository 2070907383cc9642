use axum::{extract::State, http::HeaderMap, Extension, Json};

use crate::ceremony::{CreationOptions, RelyingParty, UserVerification, ALG_ES256, ALG_RS256};
use crate::error::{ApiResponse, Result};
use crate::models::{
    ChallengePurpose, CurrentAccount, RegisterBeginResponse, RegisterCompleteRequest,
    RegisterCompleteResponse,
};
use crate::services::{ChallengeService, DeviceService, VerifierService};
use crate::AppState;

/// Start a registration ceremony for the authenticated account.
/// POST /api/v1/stepup/register/begin
pub async fn register_begin(
    State(state): State<AppState>,
    Extension(account): Extension<CurrentAccount>,
) -> Result<Json<ApiResponse<RegisterBeginResponse>>> {
    let challenge = ChallengeService::issue(
        &state.db,
        ChallengePurpose::Register,
        Some(&account.id),
        state.config.stepup.challenge_ttl_secs,
    )
    .await?;

    let exclude = DeviceService::usable_credential_ids(&state.db, &account.id).await?;
    let rp = &state.config.relying_party;

    let options = CreationOptions {
        rp: RelyingParty {
            id: rp.rp_id.clone(),
            name: rp.rp_name.clone(),
            origin: rp.rp_origin.clone(),
        },
        user_handle: account.id.clone(),
        user_name: account.id.clone(),
        challenge: challenge.nonce.clone(),
        algorithms: vec![ALG_ES256, ALG_RS256],
        exclude_credentials: exclude,
        user_verification: UserVerification::Preferred,
        timeout_ms: state.config.stepup.ceremony_timeout_ms,
    };

    Ok(Json(ApiResponse::success(RegisterBeginResponse {
        challenge_id: challenge.id,
        options,
    })))
}

/// Verify the attestation response and enroll the credential.
/// POST /api/v1/stepup/register/complete
pub async fn register_complete(
    State(state): State<AppState>,
    Extension(account): Extension<CurrentAccount>,
    headers: HeaderMap,
    Json(req): Json<RegisterCompleteRequest>,
) -> Result<Json<ApiResponse<RegisterCompleteResponse>>> {
    let device_label = req.device_label.or_else(|| {
        headers
            .get("user-agent")
            .and_then(|h| h.to_str().ok())
            .map(|ua| ua.chars().take(120).collect())
    });

    let (credential, backup_codes) = VerifierService::register(
        &state.db,
        &state.config,
        &account.id,
        device_label,
        &req.challenge_id,
        &req.credential,
    )
    .await?;

    Ok(Json(ApiResponse::success(RegisterCompleteResponse {
        device_id: credential.id,
        backup_codes,
    })))
}
