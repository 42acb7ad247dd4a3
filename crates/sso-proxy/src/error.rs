use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::backchannel::BackchannelError;

/// Proxy-side request error. Bodies stay terse; internal detail goes to the
/// log under a correlation id.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
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

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
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
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = match &self.correlation_id {
            Some(id) => format!("{} (correlation id {id})\n", self.message),
            None => format!("{}\n", self.message),
        };
        (self.status, body).into_response()
    }
}

impl From<BackchannelError> for AppError {
    fn from(value: BackchannelError) -> Self {
        match value {
            BackchannelError::Transport(_) | BackchannelError::InvalidResponse(_) => {
                AppError::bad_gateway(value.to_string())
            }
            BackchannelError::Rejected(_) => AppError::new(StatusCode::UNAUTHORIZED, value.to_string()),
        }
    }
}
