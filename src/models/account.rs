use serde::{Deserialize, Serialize};

/// Claims of the HS256 tokens exchanged with the hosting platform.
/// `purpose` separates account tokens, primary-auth proofs and grants so
/// one kind can never stand in for another.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub purpose: String,
    pub jti: String,
    pub exp: usize,
    pub iat: usize,
    /// Set by the host to the moment the primary credential was last
    /// checked; gates destructive factor changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<usize>,
}

pub const PURPOSE_ACCOUNT: &str = "account";
pub const PURPOSE_PRIMARY: &str = "primary";
pub const PURPOSE_GRANT: &str = "grant";

/// Authenticated account extracted from a bearer token. The user
/// directory itself lives in the hosting platform.
#[derive(Debug, Clone)]
pub struct CurrentAccount {
    pub id: String,
    pub auth_time: Option<usize>,
}
