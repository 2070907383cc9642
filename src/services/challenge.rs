use chrono::{Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

use crate::ceremony::encode_b64url;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{Challenge, ChallengePurpose};

const NONCE_BYTES: usize = 32;

pub struct ChallengeService;

impl ChallengeService {
    /// Issue a fresh single-use challenge. `account_id` is None only for
    /// pre-login authentication ceremonies.
    pub async fn issue(
        db: &Database,
        purpose: ChallengePurpose,
        account_id: Option<&str>,
        ttl_secs: i64,
    ) -> Result<Challenge> {
        let mut nonce = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);

        let now = Utc::now();
        let challenge = Challenge {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.map(|s| s.to_string()),
            purpose: purpose.as_str().to_string(),
            nonce: encode_b64url(&nonce),
            issued_at: now.to_rfc3339(),
            expires_at: (now + Duration::seconds(ttl_secs)).to_rfc3339(),
            consumed_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO challenges (id, account_id, purpose, nonce, issued_at, expires_at, consumed_at)
            VALUES (?, ?, ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(&challenge.id)
        .bind(challenge.account_id.as_deref())
        .bind(&challenge.purpose)
        .bind(&challenge.nonce)
        .bind(&challenge.issued_at)
        .bind(&challenge.expires_at)
        .execute(db.pool())
        .await?;

        Ok(challenge)
    }

    /// Consume a challenge exactly once. The conditional UPDATE is the
    /// linearization point: of any number of racing consumers, exactly
    /// one observes `rows_affected == 1`.
    pub async fn consume(
        db: &Database,
        id: &str,
        expected: ChallengePurpose,
    ) -> Result<Challenge> {
        let now = Utc::now().to_rfc3339();
        let affected = sqlx::query(
            r#"
            UPDATE challenges
            SET consumed_at = ?
            WHERE id = ? AND purpose = ? AND consumed_at IS NULL AND expires_at > ?
            "#,
        )
        .bind(&now)
        .bind(id)
        .bind(expected.as_str())
        .bind(&now)
        .execute(db.pool())
        .await?
        .rows_affected();

        if affected == 1 {
            let challenge: Challenge = sqlx::query_as("SELECT * FROM challenges WHERE id = ?")
                .bind(id)
                .fetch_one(db.pool())
                .await?;
            return Ok(challenge);
        }

        // Classify the failure for the caller
        let existing: Option<Challenge> = sqlx::query_as("SELECT * FROM challenges WHERE id = ?")
            .bind(id)
            .fetch_optional(db.pool())
            .await?;

        let reason = match existing {
            None => "unknown challenge",
            Some(ch) if ch.consumed_at.is_some() => "already consumed",
            Some(ch) if ch.purpose != expected.as_str() => "purpose mismatch",
            Some(ch) => {
                // Expired and never consumed; eagerly delete the row
                sqlx::query("DELETE FROM challenges WHERE id = ? AND consumed_at IS NULL")
                    .bind(&ch.id)
                    .execute(db.pool())
                    .await?;
                "expired"
            }
        };

        Err(AppError::ChallengeInvalid(reason.to_string()))
    }

    /// Delete expired challenge rows. Storage hygiene only; consumption
    /// never depends on this running.
    pub async fn sweep_expired(db: &Database) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let affected = sqlx::query("DELETE FROM challenges WHERE expires_at <= ?")
            .bind(&now)
            .execute(db.pool())
            .await?
            .rows_affected();
        Ok(affected)
    }
}
