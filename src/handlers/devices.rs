use axum::{
    extract::{Path, State},
    Extension, Json,
};

use crate::error::{ApiResponse, Result};
use crate::models::{CurrentAccount, DeviceResponse};
use crate::services::DeviceService;
use crate::AppState;

/// List enrolled devices, public fields only.
/// GET /api/v1/stepup/devices
pub async fn list_devices(
    State(state): State<AppState>,
    Extension(account): Extension<CurrentAccount>,
) -> Result<Json<ApiResponse<Vec<DeviceResponse>>>> {
    let devices = DeviceService::list(&state.db, &account.id).await?;
    Ok(Json(ApiResponse::success(devices)))
}

/// Revoke one device. Idempotent; the record is kept for audit.
/// DELETE /api/v1/stepup/devices/:id
pub async fn revoke_device(
    State(state): State<AppState>,
    Extension(account): Extension<CurrentAccount>,
    Path(device_id): Path<String>,
) -> Result<Json<ApiResponse<()>>> {
    DeviceService::revoke(&state.db, &account.id, &device_id).await?;
    Ok(Json(ApiResponse::<()>::success_message("Device revoked")))
}
