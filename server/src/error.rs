//! HTTP error mapping. Every `core` error taxonomy gets a stable `code` and
//! a status, mirroring the teacher's `ApiError { error, code }` envelope —
//! the core never leaks `rusqlite`/`reqwest` detail to a client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use braindrive_core::approval::ApprovalError;
use braindrive_core::error::{JobError, StoreError, ToolError};

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::NotFound => "NOT_FOUND",
            AppError::Tool(e) => e.code(),
            AppError::Approval(e) => e.code(),
            AppError::Job(e) => match e {
                JobError::HandlerNotRegistered(_) => "HANDLER_NOT_REGISTERED",
                JobError::NotFound => "NOT_FOUND",
                JobError::Canceled => "CANCELED",
                JobError::PayloadInvalid(_) => "PAYLOAD_INVALID",
                JobError::Store(_) => "STORE_ERROR",
            },
            AppError::Store(_) => "STORE_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Tool(ToolError::NotAllowed(_)) => StatusCode::FORBIDDEN,
            AppError::Tool(ToolError::ArgumentsInvalid(_)) => StatusCode::BAD_REQUEST,
            AppError::Tool(ToolError::HttpError { .. }) => StatusCode::BAD_GATEWAY,
            AppError::Tool(ToolError::ExecutionError(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Approval(ApprovalError::AlreadyPending) => StatusCode::CONFLICT,
            AppError::Approval(ApprovalError::NotFound) => StatusCode::NOT_FOUND,
            AppError::Approval(ApprovalError::WrongRequestId) => StatusCode::BAD_REQUEST,
            AppError::Approval(ApprovalError::Expired) => StatusCode::GONE,
            AppError::Approval(ApprovalError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Job(JobError::HandlerNotRegistered(_)) => StatusCode::BAD_REQUEST,
            AppError::Job(JobError::NotFound) => StatusCode::NOT_FOUND,
            AppError::Job(JobError::Canceled) => StatusCode::CONFLICT,
            AppError::Job(JobError::PayloadInvalid(_)) => StatusCode::BAD_REQUEST,
            AppError::Job(JobError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status() == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        let body = ApiError {
            error: self.to_string(),
            code: self.code(),
        };
        (self.status(), Json(body)).into_response()
    }
}
