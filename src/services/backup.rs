use std::collections::HashSet;

use chrono::Utc;
use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, Result};

/// Unambiguous charset: no 0/O, 1/I lookalikes
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const LOW_WATERMARK: i64 = 3;

pub struct BackupCodeService;

impl BackupCodeService {
    /// Generate a fresh batch, replacing any previous one. The clear
    /// codes are returned exactly once; only hashes are stored.
    pub async fn generate(
        db: &Database,
        account_id: &str,
        count: usize,
        length: usize,
    ) -> Result<Vec<String>> {
        let mut codes: Vec<String> = Vec::with_capacity(count);
        let mut seen = HashSet::new();
        while codes.len() < count {
            let code = generate_code(length);
            if seen.insert(code.clone()) {
                codes.push(code);
            }
        }

        let mut tx = db.pool().begin().await?;

        sqlx::query("DELETE FROM backup_codes WHERE account_id = ?")
            .bind(account_id)
            .execute(tx.as_mut())
            .await?;

        for code in &codes {
            sqlx::query(
                r#"
                INSERT INTO backup_codes (id, account_id, code_hash, used, used_at)
                VALUES (?, ?, ?, 0, NULL)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(account_id)
            .bind(hash_code(code))
            .execute(tx.as_mut())
            .await?;
        }

        tx.commit().await?;

        Ok(codes)
    }

    /// Spend a code. The conditional UPDATE is the linearization point:
    /// two concurrent attempts with the same code yield exactly one
    /// success. Returns the unused count left in the batch.
    pub async fn consume(db: &Database, account_id: &str, code: &str) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let affected = sqlx::query(
            r#"
            UPDATE backup_codes
            SET used = 1, used_at = ?
            WHERE account_id = ? AND code_hash = ? AND used = 0
            "#,
        )
        .bind(&now)
        .bind(account_id)
        .bind(hash_code(code))
        .execute(db.pool())
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(AppError::InvalidOrUsedBackupCode);
        }

        let remaining = Self::remaining(db, account_id).await?;
        if remaining <= LOW_WATERMARK {
            tracing::warn!(account = %account_id, remaining, "backup codes running low");
        }
        Ok(remaining)
    }

    pub async fn remaining(db: &Database, account_id: &str) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM backup_codes WHERE account_id = ? AND used = 0")
                .bind(account_id)
                .fetch_one(db.pool())
                .await?;
        Ok(count.0)
    }

    /// Whether the account has ever been issued a batch (used or not);
    /// gates the one-time generation at first enrollment.
    pub async fn has_codes(db: &Database, account_id: &str) -> Result<bool> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM backup_codes WHERE account_id = ?")
                .bind(account_id)
                .fetch_one(db.pool())
                .await?;
        Ok(count.0 > 0)
    }
}

fn generate_code(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Deterministic digest so consumption can address the stored row in a
/// single conditional UPDATE. Candidates are normalized first: codes are
/// displayed uppercase but users retype them.
fn hash_code(code: &str) -> String {
    let normalized = code.trim().to_ascii_uppercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_use_the_unambiguous_alphabet() {
        for _ in 0..50 {
            let code = generate_code(8);
            assert_eq!(code.len(), 8);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn hash_normalizes_case_and_whitespace() {
        assert_eq!(hash_code("abcd2345"), hash_code("  ABCD2345 "));
        assert_ne!(hash_code("ABCD2345"), hash_code("ABCD2346"));
    }
}
