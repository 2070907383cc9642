use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{Claims, CurrentAccount, PURPOSE_GRANT};

/// HS256 token exchange with the hosting platform
pub struct TokenService;

impl TokenService {
    /// Validate a token and check it was minted for the expected purpose.
    /// Tries the current secret first, then rotated-out secrets.
    pub fn validate(token: &str, config: &Config, expected_purpose: &str) -> Result<Claims> {
        let mut validation = Validation::default();
        validation.validate_exp = true;

        let keys = std::iter::once(config.tokens.secret.as_str())
            .chain(config.tokens.previous_secrets.iter().map(|s| s.as_str()));

        for secret in keys {
            if let Ok(token_data) = decode::<Claims>(
                token,
                &DecodingKey::from_secret(secret.as_bytes()),
                &validation,
            ) {
                if token_data.claims.purpose != expected_purpose {
                    return Err(AppError::Unauthorized("Invalid token".to_string()));
                }
                return Ok(token_data.claims);
            }
        }

        Err(AppError::Unauthorized("Invalid token".to_string()))
    }

    /// Mint a grant token: the step-up decision the host exchanges for a
    /// session within the grant TTL.
    pub fn issue_grant(config: &Config, account_id: &str) -> Result<String> {
        let now = Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: account_id.to_string(),
            purpose: PURPOSE_GRANT.to_string(),
            jti: Uuid::new_v4().to_string(),
            exp: now + config.tokens.grant_ttl_secs as usize,
            iat: now,
            auth_time: None,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.tokens.secret.as_bytes()),
        )?;

        Ok(token)
    }

    /// Destructive factor changes need a primary re-authentication more
    /// recent than the configured window, not merely a live session.
    pub fn require_fresh_auth(account: &CurrentAccount, config: &Config) -> Result<()> {
        let auth_time = account
            .auth_time
            .ok_or_else(|| AppError::Forbidden("Fresh re-authentication required".to_string()))?;

        let age = Utc::now().timestamp().saturating_sub(auth_time as i64);
        if age < 0 || age as u64 > config.tokens.reauth_max_age_secs {
            return Err(AppError::Forbidden(
                "Fresh re-authentication required".to_string(),
            ));
        }
        Ok(())
    }
}
