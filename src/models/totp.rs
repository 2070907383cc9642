use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stored TOTP secret. `enabled` flips to 1 only after the owner proves
/// possession with one valid code.
#[derive(Debug, Clone, FromRow)]
pub struct TotpSecret {
    pub account_id: String,
    pub secret_enc: String,
    pub enabled: i64,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct TotpBeginResponse {
    /// Base32 secret for manual entry when a QR scan is not possible.
    pub secret: String,
    pub otpauth_url: String,
}

#[derive(Debug, Deserialize)]
pub struct TotpConfirmRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct TotpConfirmResponse {
    /// Present only when this confirmation created the account's
    /// backup-code batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_codes: Option<Vec<String>>,
}
