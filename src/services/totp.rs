use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::{engine::general_purpose, Engine as _};
use cbc::{Decryptor, Encryptor};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use totp_rs::{Algorithm, TOTP};

use crate::config::Config;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::TotpSecret;
use crate::services::BackupCodeService;

const SECRET_BYTES: usize = 20; // 160 bits
const DIGITS: usize = 6;
const STEP_SECS: u64 = 30;
const SKEW_WINDOWS: u8 = 1;

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

pub struct TotpService;

impl TotpService {
    fn aes_key(config: &Config) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(config.tokens.secret.as_bytes());
        let result = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&result);
        key
    }

    fn encrypt_bytes(config: &Config, plaintext: &[u8]) -> Result<String> {
        let key = Self::aes_key(config);
        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut iv);

        let mut buf = vec![0u8; plaintext.len() + 16];
        buf[..plaintext.len()].copy_from_slice(plaintext);

        let ct = Aes256CbcEnc::new(&key.into(), &iv.into())
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
            .map_err(|_| AppError::Internal("Encrypt failed".to_string()))?;

        let mut packed = Vec::with_capacity(16 + ct.len());
        packed.extend_from_slice(&iv);
        packed.extend_from_slice(ct);
        Ok(general_purpose::STANDARD.encode(packed))
    }

    fn decrypt_bytes(config: &Config, payload_b64: &str) -> Result<Vec<u8>> {
        let payload = general_purpose::STANDARD
            .decode(payload_b64)
            .map_err(|_| AppError::BadRequest("Invalid encrypted payload".to_string()))?;
        if payload.len() < 17 {
            return Err(AppError::BadRequest("Invalid encrypted payload".to_string()));
        }
        let (iv, ct) = payload.split_at(16);
        let key = Self::aes_key(config);

        let mut buf = ct.to_vec();
        let pt = Aes256CbcDec::new(&key.into(), iv.into())
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|_| AppError::Internal("Decrypt failed".to_string()))?;
        Ok(pt.to_vec())
    }

    /// The skew setting makes `check_current` accept the current and the
    /// two adjacent 30-second windows, in constant time.
    fn totp_from_secret(config: &Config, secret: Vec<u8>, account_id: &str) -> Result<TOTP> {
        let issuer = config.relying_party.rp_name.trim();
        let issuer = if issuer.is_empty() { "EduStep" } else { issuer };
        let totp = TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            SKEW_WINDOWS,
            STEP_SECS,
            secret,
            Some(issuer.to_string()),
            account_id.to_string(),
        )
        .map_err(|e| AppError::Internal(format!("TOTP init failed: {:?}", e)))?;
        Ok(totp)
    }

    async fn fetch(db: &Database, account_id: &str) -> Result<Option<TotpSecret>> {
        let row: Option<TotpSecret> =
            sqlx::query_as("SELECT * FROM totp_secrets WHERE account_id = ?")
                .bind(account_id)
                .fetch_optional(db.pool())
                .await?;
        Ok(row)
    }

    pub async fn is_enabled(db: &Database, account_id: &str) -> Result<bool> {
        Ok(matches!(Self::fetch(db, account_id).await?, Some(row) if row.enabled != 0))
    }

    /// Start enrollment: store a fresh secret disabled and hand back the
    /// base32 secret plus the provisioning URI. Re-running before
    /// confirmation rotates the pending secret.
    pub async fn begin_enrollment(
        db: &Database,
        config: &Config,
        account_id: &str,
    ) -> Result<(String, String)> {
        if Self::is_enabled(db, account_id).await? {
            return Err(AppError::Conflict(
                "Two-factor authentication is already enabled".to_string(),
            ));
        }

        let mut secret = vec![0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut secret);

        let secret_enc = Self::encrypt_bytes(config, &secret)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO totp_secrets (account_id, secret_enc, enabled, created_at)
            VALUES (?, ?, 0, ?)
            ON CONFLICT(account_id) DO UPDATE
            SET secret_enc = excluded.secret_enc, created_at = excluded.created_at
            WHERE totp_secrets.enabled = 0
            "#,
        )
        .bind(account_id)
        .bind(&secret_enc)
        .bind(&now)
        .execute(db.pool())
        .await?;

        let totp = Self::totp_from_secret(config, secret, account_id)?;
        Ok((totp.get_secret_base32(), totp.get_url()))
    }

    /// Prove possession of the pending secret; only then does the factor
    /// become enabled. First-time enrollment also creates the account's
    /// backup-code batch, returned in clear exactly once.
    pub async fn confirm_enrollment(
        db: &Database,
        config: &Config,
        account_id: &str,
        code: &str,
    ) -> Result<Option<Vec<String>>> {
        let row = Self::fetch(db, account_id).await?.ok_or_else(|| {
            AppError::BadRequest("No pending two-factor enrollment".to_string())
        })?;
        if row.enabled != 0 {
            return Err(AppError::Conflict(
                "Two-factor authentication is already enabled".to_string(),
            ));
        }

        let secret = Self::decrypt_bytes(config, &row.secret_enc)?;
        let totp = Self::totp_from_secret(config, secret, account_id)?;
        let ok = totp
            .check_current(code)
            .map_err(|_| AppError::InvalidTotpCode)?;
        if !ok {
            return Err(AppError::InvalidTotpCode);
        }

        sqlx::query("UPDATE totp_secrets SET enabled = 1 WHERE account_id = ? AND enabled = 0")
            .bind(account_id)
            .execute(db.pool())
            .await?;

        let backup_codes = if BackupCodeService::has_codes(db, account_id).await? {
            None
        } else {
            Some(
                BackupCodeService::generate(
                    db,
                    account_id,
                    config.stepup.backup_code_count,
                    config.stepup.backup_code_length,
                )
                .await?,
            )
        };

        Ok(backup_codes)
    }

    /// Login-time verification against the enabled secret.
    pub async fn verify_code(
        db: &Database,
        config: &Config,
        account_id: &str,
        code: &str,
    ) -> Result<()> {
        let row = match Self::fetch(db, account_id).await? {
            Some(row) if row.enabled != 0 => row,
            _ => return Err(AppError::InvalidTotpCode),
        };

        let secret = Self::decrypt_bytes(config, &row.secret_enc)?;
        let totp = Self::totp_from_secret(config, secret, account_id)?;
        let ok = totp
            .check_current(code)
            .map_err(|_| AppError::InvalidTotpCode)?;
        if !ok {
            return Err(AppError::InvalidTotpCode);
        }
        Ok(())
    }

    /// Remove the secret entirely. Callers must have required a fresh
    /// primary re-authentication first; a live session is not enough.
    pub async fn disable(db: &Database, account_id: &str) -> Result<()> {
        let affected = sqlx::query("DELETE FROM totp_secrets WHERE account_id = ?")
            .bind(account_id)
            .execute(db.pool())
            .await?
            .rows_affected();

        if affected == 0 {
            return Err(AppError::BadRequest(
                "Two-factor authentication is not enabled".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_secret() -> Config {
        let mut config = Config::default();
        config.tokens.secret = "unit-test-secret".to_string();
        config
    }

    #[test]
    fn secret_encryption_round_trips() {
        let config = config_with_secret();
        let secret = b"12345678901234567890";
        let packed = TotpService::encrypt_bytes(&config, secret).unwrap();
        assert_eq!(TotpService::decrypt_bytes(&config, &packed).unwrap(), secret);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let config = config_with_secret();
        assert!(TotpService::decrypt_bytes(&config, "too-short").is_err());
    }

    #[test]
    fn rfc_6238_sha1_vectors() {
        // Appendix B of RFC 6238, truncated to the 6-digit suffix the
        // engine is configured for.
        let config = config_with_secret();
        let secret = b"12345678901234567890".to_vec();
        let totp = TotpService::totp_from_secret(&config, secret, "acct-1").unwrap();

        let cases: [(u64, &str); 4] = [
            (59, "287082"),
            (1_111_111_109, "081804"),
            (1_234_567_890, "005924"),
            (2_000_000_000, "279037"),
        ];
        for (time, expected) in cases {
            assert_eq!(totp.generate(time), expected);
        }
    }

    #[test]
    fn adjacent_window_codes_verify_but_distant_ones_do_not() {
        let config = config_with_secret();
        let secret = b"12345678901234567890".to_vec();
        let totp = TotpService::totp_from_secret(&config, secret, "acct-1").unwrap();

        let now = 1_111_111_109u64;
        let previous = totp.generate(now - STEP_SECS);
        let distant = totp.generate(now - 2 * STEP_SECS);

        assert!(totp.check(&previous, now));
        assert!(!totp.check(&distant, now));
    }

    #[test]
    fn provisioning_uri_names_the_relying_party() {
        let config = config_with_secret();
        let secret = b"12345678901234567890".to_vec();
        let totp = TotpService::totp_from_secret(&config, secret, "acct-1").unwrap();
        let url = totp.get_url();
        assert!(url.starts_with("otpauth://totp/"));
        assert!(url.contains("EduStep"));
    }
}
