//! Transactional persistence for jobs, attempts, progress events, approval
//! state, and tool registry state (§2, §3).
//!
//! The core depends only on the `Store` trait. Two implementations are
//! provided: `SqliteStore` (production, backed by `rusqlite`) and
//! `MemoryStore` (tests — no IO, trivial to reason about for ordering
//! assertions).
//!
//! All methods are synchronous: sqlite transactions here are short local
//! operations, matching the teacher's `storage::sessions::SessionManager`
//! convention of plain blocking `rusqlite` calls rather than an async
//! database driver.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;
use crate::model::{
    ApprovalRequest, ApprovalResolution, Job, JobStatus, JobTypeDefinition, McpServerRecord,
    ProgressEvent, Tool,
};

/// A page of jobs, matching the `{jobs, total, page, page_size, has_next}`
/// shape from `enqueue`/`list` in §6.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub has_next: bool,
}

#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
}

pub trait Store: Send + Sync {
    // ---- Jobs -----------------------------------------------------------
    fn insert_job(&self, job: &Job) -> Result<(), StoreError>;
    fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError>;
    fn find_job_by_idempotency_key(
        &self,
        user_id: &str,
        job_type: &str,
        idempotency_key: &str,
    ) -> Result<Option<Job>, StoreError>;
    fn replace_job(&self, job: &Job) -> Result<(), StoreError>;
    /// Atomically claims the highest-priority, earliest-`scheduled_for`
    /// queued job whose `scheduled_for <= now`, transitioning it to
    /// `running`. Returns `Ok(None)` if there was nothing to claim or the
    /// optimistic update lost a race (§4.6 claim algorithm).
    fn claim_next_queued_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;
    fn list_jobs(
        &self,
        user_id: &str,
        filter: &JobListFilter,
        page: u32,
        page_size: u32,
    ) -> Result<JobPage, StoreError>;
    fn delete_job(&self, id: &str, user_id: &str) -> Result<bool, StoreError>;
    /// Any job left `running` from a previous process is marked `failed`
    /// (§4.6 startup recovery). Returns the recovered jobs.
    fn recover_stale_running_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    // ---- Attempts ---------------------------------------------------------
    fn create_attempt(&self, job_id: &str, started_at: DateTime<Utc>) -> Result<u32, StoreError>;
    fn complete_attempt(
        &self,
        job_id: &str,
        attempt_number: u32,
        status: JobStatus,
        completed_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), StoreError>;
    /// Force-closes any `running` attempt rows for a job with the given
    /// terminal status and error message — used both by idempotent
    /// reset-on-retry ("Superseded by retry") and startup recovery
    /// ("Worker interrupted").
    fn fail_running_attempts(
        &self,
        job_id: &str,
        status: JobStatus,
        completed_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError>;

    // ---- Progress events ----------------------------------------------------
    fn append_progress_event(
        &self,
        job_id: &str,
        event_type: &str,
        data: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<ProgressEvent, StoreError>;
    fn list_progress_events(
        &self,
        job_id: &str,
        since: Option<u64>,
    ) -> Result<Vec<ProgressEvent>, StoreError>;

    // ---- Job type definitions -----------------------------------------------
    fn upsert_job_type_definition(&self, def: &JobTypeDefinition) -> Result<(), StoreError>;

    // ---- Approval ledger ----------------------------------------------------
    /// Inserts the request iff there is no unresolved request for the
    /// conversation; otherwise returns `Err(StoreError::Conflict)`.
    fn stage_approval(&self, request: &ApprovalRequest) -> Result<(), StoreError>;
    fn get_pending_approval(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ApprovalRequest>, StoreError>;
    fn get_approval(&self, request_id: &str) -> Result<Option<ApprovalRequest>, StoreError>;
    fn resolve_approval(
        &self,
        request_id: &str,
        resolution: ApprovalResolution,
        resolved_at: DateTime<Utc>,
    ) -> Result<Option<ApprovalRequest>, StoreError>;

    // ---- Tool registry ------------------------------------------------------
    fn upsert_tool(&self, tool: &Tool) -> Result<(), StoreError>;
    /// Marks every enabled tool for `server_id` not in `active_names` as
    /// `stale=true, enabled=false`. Returns the count newly marked.
    fn mark_tools_stale_except(
        &self,
        server_id: &str,
        active_names: &[String],
    ) -> Result<usize, StoreError>;
    fn get_enabled_tool(&self, user_id: &str, name: &str) -> Result<Option<Tool>, StoreError>;
    fn list_enabled_tools(&self, user_id: &str) -> Result<Vec<Tool>, StoreError>;
    fn upsert_server(&self, server: &McpServerRecord) -> Result<(), StoreError>;
    fn list_servers(&self, user_id: &str) -> Result<Vec<McpServerRecord>, StoreError>;
    fn get_server(&self, id: &str) -> Result<Option<McpServerRecord>, StoreError>;

    // ---- Conversation event history -----------------------------------------
    /// Records whether `(conversation_id, guard_kind, event_id)` has been
    /// seen before. Returns `true` the first time (the guard passes) and
    /// `false` on a repeat, backing the digest-schedule and pre-compaction
    /// duplicate guards (§4.5 "Duplicate guards").
    fn observe_conversation_event(
        &self,
        conversation_id: &str,
        guard_kind: &str,
        event_id: &str,
    ) -> Result<bool, StoreError>;
}
