use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::SecondFactorMethod;
use crate::services::{BackupCodeService, DeviceService, TokenService, TotpService};

/// Login state machine states. A login either completes or restarts from
/// the beginning; there is no partial credit across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    PrimaryPending,
    PrimaryVerified,
    SecondFactorPending,
    SecondFactorSatisfied,
    Granted,
    Denied,
    Expired,
}

#[derive(Debug, Clone, Copy)]
pub enum LoginEvent {
    PrimaryVerified,
    SecondFactorRequired,
    SecondFactorSatisfied,
    SessionGranted,
    Expired,
    Denied,
}

/// Pure transition function; illegal transitions are rejected rather
/// than silently tolerated.
pub fn apply(state: LoginState, event: LoginEvent) -> Result<LoginState> {
    use LoginEvent as E;
    use LoginState as S;

    let next = match (state, event) {
        (S::PrimaryPending, E::PrimaryVerified) => S::PrimaryVerified,
        (S::PrimaryVerified, E::SecondFactorRequired) => S::SecondFactorPending,
        (S::PrimaryVerified, E::SessionGranted) => S::Granted,
        (S::SecondFactorPending, E::SecondFactorSatisfied) => S::SecondFactorSatisfied,
        (S::SecondFactorSatisfied, E::SessionGranted) => S::Granted,
        (_, E::Expired) => S::Expired,
        (_, E::Denied) => S::Denied,
        (from, event) => {
            return Err(AppError::Conflict(format!(
                "illegal login transition from {:?} on {:?}",
                from, event
            )))
        }
    };
    Ok(next)
}

/// A login attempt between the external primary check and the session
/// grant. Held in memory only, never persisted.
#[derive(Debug, Clone)]
pub struct PendingLogin {
    pub id: String,
    pub account_id: String,
    pub state: LoginState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingLogin {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Explicit in-memory store for pending logins, handed around via app
/// state. Expiry is enforced on every access; the sweeper only reclaims
/// memory for attempts nobody touches again.
pub struct PendingLoginStore {
    ttl_secs: i64,
    inner: RwLock<HashMap<String, PendingLogin>>,
}

impl PendingLoginStore {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            ttl_secs,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, account_id: &str, state: LoginState) -> PendingLogin {
        let now = Utc::now();
        let pending = PendingLogin {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            state,
            created_at: now,
            expires_at: now + Duration::seconds(self.ttl_secs),
        };
        let mut guard = self.inner.write().await;
        guard.insert(pending.id.clone(), pending.clone());
        pending
    }

    /// Fetch a live pending login. An expired one is evicted and the
    /// whole attempt has to restart from the primary check.
    pub async fn get(&self, id: &str) -> Result<PendingLogin> {
        let mut guard = self.inner.write().await;
        match guard.get(id) {
            None => Err(AppError::NotFound("Unknown login attempt".to_string())),
            Some(pending) if pending.is_expired(Utc::now()) => {
                guard.remove(id);
                Err(AppError::SecondFactorTimeout)
            }
            Some(pending) => Ok(pending.clone()),
        }
    }

    pub async fn remove(&self, id: &str) {
        let mut guard = self.inner.write().await;
        guard.remove(id);
    }

    /// Evict expired entries; returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut guard = self.inner.write().await;
        let before = guard.len();
        guard.retain(|_, pending| !pending.is_expired(now));
        before - guard.len()
    }
}

pub enum StartOutcome {
    /// No enabled second factor; the attempt resolves immediately.
    Granted { grant_token: String },
    /// A second factor must be satisfied before a grant.
    Pending {
        pending: PendingLogin,
        methods: Vec<SecondFactorMethod>,
    },
}

pub struct LoginService;

impl LoginService {
    /// Entry point after the hosting platform's primary credential check.
    pub async fn start(
        db: &Database,
        store: &PendingLoginStore,
        config: &Config,
        account_id: &str,
    ) -> Result<StartOutcome> {
        let state = apply(LoginState::PrimaryPending, LoginEvent::PrimaryVerified)?;

        let methods = Self::available_methods(db, account_id).await?;
        if methods.is_empty() {
            let state = apply(state, LoginEvent::SessionGranted)?;
            debug_assert_eq!(state, LoginState::Granted);
            let grant_token = TokenService::issue_grant(config, account_id)?;
            tracing::info!(account = %account_id, "login granted without second factor");
            return Ok(StartOutcome::Granted { grant_token });
        }

        let state = apply(state, LoginEvent::SecondFactorRequired)?;
        let pending = store.insert(account_id, state).await;
        tracing::debug!(account = %account_id, pending = %pending.id, "second factor required");
        Ok(StartOutcome::Pending { pending, methods })
    }

    async fn available_methods(db: &Database, account_id: &str) -> Result<Vec<SecondFactorMethod>> {
        let mut methods = Vec::new();
        if DeviceService::usable_count(db, account_id).await? > 0 {
            methods.push(SecondFactorMethod::Passkey);
        }
        if TotpService::is_enabled(db, account_id).await? {
            methods.push(SecondFactorMethod::Totp);
        }
        if BackupCodeService::remaining(db, account_id).await? > 0 {
            methods.push(SecondFactorMethod::BackupCode);
        }
        Ok(methods)
    }

    /// Called once a second factor verified for this pending login.
    /// Re-reads the store so an attempt that expired mid-verification
    /// still restarts instead of being granted.
    pub async fn grant(
        store: &PendingLoginStore,
        config: &Config,
        pending_id: &str,
    ) -> Result<String> {
        let current = store.get(pending_id).await?;
        let state = apply(current.state, LoginEvent::SecondFactorSatisfied)?;
        let state = apply(state, LoginEvent::SessionGranted)?;
        debug_assert_eq!(state, LoginState::Granted);

        store.remove(pending_id).await;
        let grant_token = TokenService::issue_grant(config, &current.account_id)?;
        tracing::info!(account = %current.account_id, "login granted after second factor");
        Ok(grant_token)
    }
}
