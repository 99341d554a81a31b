use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::systemd_client::CommandError;

/// A probe that could not tell whether the unit is running.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("inconclusive status (exit code {code}): {detail}")]
    Inconclusive { code: i32, detail: String },
    #[error("status query terminated by signal: {detail}")]
    Terminated { detail: String },
}

/// Failure detail of a start/restart attempt.
#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("rc={code} {detail}")]
    NonZeroExit { code: i32, detail: String },
    #[error("rc=-1 {0}")]
    Command(String),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {message}")]
    NotFound {
        code: &'static str,
        message: String,
    },
    #[error("internal error")]
    Internal { code: &'static str, message: String },
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

impl AppError {
    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            code: "internal_error",
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::NotFound { code, message } => (StatusCode::NOT_FOUND, code, message),
            Self::Internal { code, message } => {
                tracing::error!(error = %message, "request failed with internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    code,
                    "internal server error".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorResponse {
                code: code.to_string(),
                message,
                details: json!({}),
            }),
        )
            .into_response()
    }
}
