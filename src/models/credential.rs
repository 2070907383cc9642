use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Enrolled platform-authenticator credential. `sign_count`,
/// `last_used_at`, `revoked` and `flagged_at` are the only mutable fields.
#[derive(Debug, Clone, FromRow)]
pub struct Credential {
    pub id: String,
    pub account_id: String,
    pub credential_id: String,
    pub public_key_cose: String,
    pub sign_count: i64,
    pub device_label: Option<String>,
    pub revoked: i64,
    pub flagged_at: Option<String>,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

impl Credential {
    pub fn is_revoked(&self) -> bool {
        self.revoked != 0
    }

    pub fn is_flagged(&self) -> bool {
        self.flagged_at.is_some()
    }
}

/// Public view of a credential for device listings. Key material and
/// counters stay server-side.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceResponse {
    pub id: String,
    pub device_label: Option<String>,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

impl From<Credential> for DeviceResponse {
    fn from(c: Credential) -> Self {
        Self {
            id: c.id,
            device_label: c.device_label,
            created_at: c.created_at,
            last_used_at: c.last_used_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterBeginResponse {
    pub challenge_id: String,
    pub options: crate::ceremony::CreationOptions,
}

#[derive(Debug, Deserialize)]
pub struct RegisterCompleteRequest {
    pub challenge_id: String,
    pub credential: crate::ceremony::SerializedAttestation,
    pub device_label: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterCompleteResponse {
    pub device_id: String,
    /// Present only when this enrollment created the account's
    /// backup-code batch; the clear codes are never shown again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_codes: Option<Vec<String>>,
}
