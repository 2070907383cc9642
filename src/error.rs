use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Challenge invalid: {0}")]
    ChallengeInvalid(String),

    #[error("Origin mismatch: expected {expected}, got {got}")]
    OriginMismatch { expected: String, got: String },

    #[error("Challenge mismatch")]
    ChallengeMismatch,

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Signature counter regression for credential {0}")]
    PossibleCloneDetected(String),

    #[error("Unknown or revoked credential")]
    UnknownOrRevokedCredential,

    #[error("Invalid verification code")]
    InvalidTotpCode,

    #[error("Invalid or already used backup code")]
    InvalidOrUsedBackupCode,

    #[error("Login attempt expired")]
    SecondFactorTimeout,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn success_message(message: &str) -> ApiResponse<()> {
        ApiResponse {
            code: 0,
            message: message.to_string(),
            data: None,
        }
    }

    pub fn error(code: i32, message: &str) -> ApiResponse<()> {
        ApiResponse {
            code,
            message: message.to_string(),
            data: None,
        }
    }
}

impl AppError {
    /// Stable machine code carried in the error envelope. Step-up failures
    /// get their own range so callers can tell them apart from generic
    /// auth failures.
    fn code(&self) -> i32 {
        match self {
            AppError::ChallengeInvalid(_) => 1001,
            AppError::OriginMismatch { .. } => 1002,
            AppError::ChallengeMismatch => 1003,
            AppError::SignatureInvalid => 1004,
            AppError::PossibleCloneDetected(_) => 1005,
            AppError::UnknownOrRevokedCredential => 1006,
            AppError::InvalidTotpCode => 1007,
            AppError::InvalidOrUsedBackupCode => 1008,
            AppError::SecondFactorTimeout => 1009,
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized(_) | AppError::Jwt(_) => 401,
            AppError::Forbidden(_) => 403,
            AppError::NotFound(_) => 404,
            AppError::Conflict(_) => 409,
            AppError::Database(_) | AppError::Internal(_) => 500,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            AppError::ChallengeInvalid(_)
            | AppError::OriginMismatch { .. }
            | AppError::ChallengeMismatch => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::PossibleCloneDetected(_)
            | AppError::SignatureInvalid
            | AppError::UnknownOrRevokedCredential
            | AppError::InvalidTotpCode
            | AppError::InvalidOrUsedBackupCode => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::SecondFactorTimeout => (StatusCode::GONE, self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Jwt(e) => {
                tracing::warn!("Token error: {:?}", e);
                (StatusCode::UNAUTHORIZED, "Invalid token".to_string())
            }
        };

        let body = Json(ApiResponse::<()>::error(code, &message));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
