use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{Credential, DeviceResponse};

/// Device trust registry: the persisted list of enrolled credentials per
/// account. Credentials are never deleted, only revoked.
pub struct DeviceService;

impl DeviceService {
    /// Non-revoked devices, public fields only.
    pub async fn list(db: &Database, account_id: &str) -> Result<Vec<DeviceResponse>> {
        let credentials: Vec<Credential> = sqlx::query_as(
            r#"
            SELECT * FROM credentials
            WHERE account_id = ? AND revoked = 0
            ORDER BY created_at DESC
            "#,
        )
        .bind(account_id)
        .fetch_all(db.pool())
        .await?;

        Ok(credentials.into_iter().map(DeviceResponse::from).collect())
    }

    /// Idempotent revocation. Other credentials and factors are untouched;
    /// revoking the last device does not disable TOTP or backup codes.
    pub async fn revoke(db: &Database, account_id: &str, device_id: &str) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE credentials SET revoked = 1 WHERE id = ? AND account_id = ?",
        )
        .bind(device_id)
        .bind(account_id)
        .execute(db.pool())
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(AppError::NotFound("Device not found".to_string()));
        }
        Ok(())
    }

    /// Credentials usable for login right now (not revoked, not flagged).
    pub async fn usable_count(db: &Database, account_id: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM credentials WHERE account_id = ? AND revoked = 0 AND flagged_at IS NULL",
        )
        .bind(account_id)
        .fetch_one(db.pool())
        .await?;
        Ok(count.0)
    }

    /// Raw credential ids for ceremony allow/exclude lists.
    pub async fn usable_credential_ids(db: &Database, account_id: &str) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT credential_id FROM credentials WHERE account_id = ? AND revoked = 0 AND flagged_at IS NULL",
        )
        .bind(account_id)
        .fetch_all(db.pool())
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}
