use serde::Deserialize;

use super::UserProfile;

/// Response of `POST auth/login` and `POST auth/signup`
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub expires_in: i64,
    pub refresh_token: String,
    pub session_id: String,
    pub user: UserProfile,
}

/// Response of `POST auth/token`. The refresh token rotates on every call.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    pub refresh_token: String,
}

/// Backend error envelope: `{"detail": {"message": ..., "code": ...}}`
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub detail: ErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(default)]
    pub code: Option<u32>,
}

/// Numeric error codes used by the QAdapt backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    GeneralError,
    InvalidRequest,
    InvalidJson,
    InvalidParameter,
    FileTooLarge,
    ResourceNotFound,
    ProcessingError,
    ValidationError,
    ResourceConflict,
    RateLimitExceeded,
    ServiceUnavailable,
    InternalServerError,
    AuthenticationError,
    IncorrectCredentials,
    Other(u32),
}

impl ErrorCode {
    pub fn from_code(code: u32) -> Self {
        match code {
            1000 => ErrorCode::GeneralError,
            1100 => ErrorCode::InvalidRequest,
            1101 => ErrorCode::InvalidJson,
            1102 => ErrorCode::InvalidParameter,
            1103 => ErrorCode::FileTooLarge,
            1104 => ErrorCode::ResourceNotFound,
            1105 => ErrorCode::ProcessingError,
            1200 => ErrorCode::ValidationError,
            1300 => ErrorCode::ResourceConflict,
            1400 => ErrorCode::RateLimitExceeded,
            1500 => ErrorCode::ServiceUnavailable,
            1501 => ErrorCode::InternalServerError,
            1600 => ErrorCode::AuthenticationError,
            1601 => ErrorCode::IncorrectCredentials,
            other => ErrorCode::Other(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            ErrorCode::GeneralError => 1000,
            ErrorCode::InvalidRequest => 1100,
            ErrorCode::InvalidJson => 1101,
            ErrorCode::InvalidParameter => 1102,
            ErrorCode::FileTooLarge => 1103,
            ErrorCode::ResourceNotFound => 1104,
            ErrorCode::ProcessingError => 1105,
            ErrorCode::ValidationError => 1200,
            ErrorCode::ResourceConflict => 1300,
            ErrorCode::RateLimitExceeded => 1400,
            ErrorCode::ServiceUnavailable => 1500,
            ErrorCode::InternalServerError => 1501,
            ErrorCode::AuthenticationError => 1600,
            ErrorCode::IncorrectCredentials => 1601,
            ErrorCode::Other(code) => *code,
        }
    }

    /// Authentication failures (bad password, revoked session)
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            ErrorCode::AuthenticationError | ErrorCode::IncorrectCredentials
        )
    }
}
