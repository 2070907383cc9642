use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct LoginStartRequest {
    /// Proof from the hosting platform that the primary credential check
    /// just succeeded for this account.
    pub primary_token: String,
}

/// Second factors a pending login may be completed with.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondFactorMethod {
    Passkey,
    Totp,
    BackupCode,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginStartResponse {
    Granted {
        grant_token: String,
    },
    SecondFactorRequired {
        pending_login_id: String,
        methods: Vec<SecondFactorMethod>,
    },
}

#[derive(Debug, Deserialize)]
pub struct LoginBeginRequest {
    pub pending_login_id: String,
}

#[derive(Debug, Serialize)]
pub struct LoginBeginResponse {
    pub challenge_id: String,
    pub options: crate::ceremony::RequestOptions,
}

#[derive(Debug, Deserialize)]
pub struct LoginCompleteRequest {
    pub pending_login_id: String,
    pub challenge_id: String,
    pub credential: crate::ceremony::SerializedAssertion,
}

#[derive(Debug, Deserialize)]
pub struct VerifyTotpRequest {
    pub pending_login_id: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyBackupRequest {
    pub pending_login_id: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct GrantResponse {
    pub grant_token: String,
    /// Unused backup codes left after this login; present only when one
    /// was spent, so the client can warn the owner when the pool runs low.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_codes_remaining: Option<i64>,
}
