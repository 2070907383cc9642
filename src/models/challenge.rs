use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// What a challenge may be spent on. A `Register` challenge can never
/// satisfy an `Authenticate` verification and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengePurpose {
    Register,
    Authenticate,
}

impl ChallengePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengePurpose::Register => "register",
            ChallengePurpose::Authenticate => "authenticate",
        }
    }
}

/// Single-use ceremony challenge. `account_id` is null only for pre-login
/// authentication challenges.
#[derive(Debug, Clone, FromRow)]
pub struct Challenge {
    pub id: String,
    pub account_id: Option<String>,
    pub purpose: String,
    pub nonce: String,
    pub issued_at: String,
    pub expires_at: String,
    pub consumed_at: Option<String>,
}
