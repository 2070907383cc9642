use serde::Serialize;
use sqlx::FromRow;

/// One backup code, stored as a hash, spendable exactly once.
#[derive(Debug, Clone, FromRow)]
pub struct BackupCode {
    pub id: String,
    pub account_id: String,
    pub code_hash: String,
    pub used: i64,
    pub used_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BackupStatusResponse {
    pub remaining: i64,
}

#[derive(Debug, Serialize)]
pub struct BackupRegenerateResponse {
    pub backup_codes: Vec<String>,
}
