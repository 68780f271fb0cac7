//! Error taxonomy (§7). Each component gets a typed error enum instead of a
//! broad exception; handler/tool failures are reified into data
//! (`tooling_state.errors`, job `error` fields) rather than propagated
//! across the API boundary.

use thiserror::Error;

/// Errors from the persistence layer. `Conflict` models a failed optimistic
/// claim (§4.6 "if rowcount=0 the worker rolls back and retries").
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("optimistic claim conflict")]
    Conflict,
    #[error("not found")]
    NotFound,
}

/// Tool invocation failures (§4.3, §7).
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool '{0}' is not enabled for this user")]
    NotAllowed(String),
    #[error("tool arguments failed schema validation: {0:?}")]
    ArgumentsInvalid(Vec<String>),
    #[error("tool call failed with status {status}")]
    HttpError {
        status: u16,
        body: serde_json::Value,
    },
    #[error("tool execution error: {0}")]
    ExecutionError(String),
}

impl ToolError {
    /// The stable error code from the §4.3 taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::NotAllowed(_) => "TOOL_NOT_ALLOWED",
            ToolError::ArgumentsInvalid(_) => "TOOL_ARGUMENTS_INVALID",
            ToolError::HttpError { .. } => "TOOL_HTTP_ERROR",
            ToolError::ExecutionError(_) => "TOOL_EXECUTION_ERROR",
        }
    }
}

/// Approval-gate failures (§4.2, §7). Fatal for the current resolution
/// attempt; conversation state is unchanged.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("a request is already pending for this conversation")]
    AlreadyPending,
    #[error("approval request not found")]
    NotFound,
    #[error("resolution request_id does not match the pending request")]
    WrongRequestId,
    #[error("approval request expired")]
    Expired,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApprovalError {
    pub fn code(&self) -> &'static str {
        match self {
            ApprovalError::AlreadyPending => "ALREADY_PENDING",
            ApprovalError::NotFound => "NOT_FOUND",
            ApprovalError::WrongRequestId => "WRONG_REQUEST_ID",
            ApprovalError::Expired => "EXPIRED",
            ApprovalError::Store(_) => "STORE_ERROR",
        }
    }
}

/// Job lifecycle failures (§4.6, §7).
#[derive(Debug, Error)]
pub enum JobError {
    #[error("no handler registered for job_type={0}")]
    HandlerNotRegistered(String),
    #[error("job not found")]
    NotFound,
    #[error("job canceled by user request")]
    Canceled,
    #[error("invalid payload: {0}")]
    PayloadInvalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
