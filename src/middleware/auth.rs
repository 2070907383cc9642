use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::models::{CurrentAccount, PURPOSE_ACCOUNT};
use crate::services::TokenService;
use crate::AppState;

/// Account authentication middleware.
/// Validates the host-minted bearer token and exposes the account to
/// handlers. The user directory itself lives in the hosting platform;
/// the token is the only account context this service sees.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(header) if header.starts_with("Bearer ") => &header[7..],
        _ => {
            return Err(AppError::Unauthorized(
                "Missing or invalid Authorization header".to_string(),
            ));
        }
    };

    let claims = TokenService::validate(token, &state.config, PURPOSE_ACCOUNT)?;

    let current_account = CurrentAccount {
        id: claims.sub,
        auth_time: claims.auth_time,
    };
    request.extensions_mut().insert(current_account);

    Ok(next.run(request).await)
}
