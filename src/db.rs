use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::error::Result;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: &str) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        // Enrolled credentials. Rows are never deleted, only revoked, so
        // the device history stays available for audit.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                credential_id TEXT UNIQUE NOT NULL,
                public_key_cose TEXT NOT NULL,
                sign_count INTEGER NOT NULL DEFAULT 0,
                device_label TEXT,
                revoked INTEGER NOT NULL DEFAULT 0,
                flagged_at TEXT,
                created_at TEXT NOT NULL,
                last_used_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Ceremony challenges, consumed at most once. Expired rows are
        // garbage; the sweeper deletes them.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS challenges (
                id TEXT PRIMARY KEY,
                account_id TEXT,
                purpose TEXT NOT NULL,
                nonce TEXT NOT NULL,
                issued_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                consumed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One TOTP secret per account, disabled until the enrollment is
        // confirmed with a valid code.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS totp_secrets (
                account_id TEXT PRIMARY KEY,
                secret_enc TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_codes (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                code_hash TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                used_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Create indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_credentials_account_id ON credentials(account_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_challenges_expires_at ON challenges(expires_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_backup_codes_account_id ON backup_codes(account_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_backup_codes_account_hash ON backup_codes(account_id, code_hash)",
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("Database migrations completed");
        Ok(())
    }
}
