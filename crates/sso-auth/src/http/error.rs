use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use sso_core::provider::{ProviderError, ProviderErrorKind};
use sso_core::sealed::SealError;
use tracing::error;

use crate::code::CodeError;

/// HTTP-facing error. Internal failures get a correlation id that is logged
/// and echoed to the client in place of any detail.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    correlation_id: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            correlation_id: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let message = message.into();
        error!(%correlation_id, %message, "internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
            correlation_id: Some(correlation_id),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
                correlation_id: self.correlation_id,
            }),
        )
            .into_response()
    }
}

impl From<ProviderError> for AppError {
    fn from(value: ProviderError) -> Self {
        match value.kind() {
            ProviderErrorKind::Transport | ProviderErrorKind::InvalidResponse => {
                AppError::bad_gateway(value.to_string())
            }
            ProviderErrorKind::TokenRevoked => AppError::unauthorized(value.to_string()),
            ProviderErrorKind::Unsupported => {
                AppError::new(StatusCode::NOT_IMPLEMENTED, value.to_string())
            }
            ProviderErrorKind::Configuration => AppError::internal(value.to_string()),
        }
    }
}

impl From<CodeError> for AppError {
    fn from(value: CodeError) -> Self {
        match value {
            CodeError::Expired => AppError::unauthorized("code expired"),
            CodeError::InvalidKey(_) => AppError::internal(value.to_string()),
            _ => AppError::unauthorized("invalid code"),
        }
    }
}

impl From<SealError> for AppError {
    fn from(value: SealError) -> Self {
        match value {
            SealError::InvalidKey(_) => AppError::internal(value.to_string()),
            _ => AppError::unauthorized("invalid session"),
        }
    }
}

impl From<url::ParseError> for AppError {
    fn from(value: url::ParseError) -> Self {
        AppError::bad_request(value.to_string())
    }
}
