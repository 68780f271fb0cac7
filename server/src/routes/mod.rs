//! Route nesting, mirroring the teacher's `routes::api_router` — one
//! sub-router per resource, composed in `lib::build_router`.

mod chat;
mod jobs;

use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(chat::router())
        .merge(jobs::router())
}

/// Extracts the calling user from `X-BrainDrive-User-Id`, the same header
/// name the MCP tool-call contract (§4.3) already defines for downstream
/// calls. This crate has no session/auth system of its own (§1 non-goal);
/// the header is trusted as-is, same posture as the teacher's self-host
/// `X-User-Id` shim.
pub(crate) fn user_id_header(headers: &axum::http::HeaderMap) -> Result<String, crate::error::AppError> {
    headers
        .get("X-BrainDrive-User-Id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| crate::error::AppError::BadRequest("missing X-BrainDrive-User-Id header".to_string()))
}
