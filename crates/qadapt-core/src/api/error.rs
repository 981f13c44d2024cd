use thiserror::Error;

use crate::models::{ErrorCode, ErrorResponse};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - session may have been revoked")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{message} (code {})", .code.code())]
    Backend { code: ErrorCode, message: String },
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Truncate a response body to avoid logging excessive data
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

impl ApiError {
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        // Client errors with the backend's structured envelope carry a
        // message meant for the user
        if status.is_client_error() && status.as_u16() != 429 {
            if let Ok(parsed) = serde_json::from_str::<ErrorResponse>(body) {
                if let Some(code) = parsed.detail.code {
                    return ApiError::Backend {
                        code: ErrorCode::from_code(code),
                        message: parsed.detail.message,
                    };
                }
            }
        }

        let truncated = truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// The server refused the credential, with or without the backend
    /// error envelope
    pub fn is_unauthorized(&self) -> bool {
        match self {
            ApiError::Unauthorized => true,
            ApiError::Backend { code, .. } => code.is_authentication(),
            _ => false,
        }
    }

    /// Backend error code, when the server sent one
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ApiError::Backend { code, .. } => Some(*code),
            _ => None,
        }
    }
}
