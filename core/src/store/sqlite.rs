//! SQLite-backed `Store`, grounded on the teacher's
//! `storage::sessions::SessionManager` — a thin wrapper around a shared
//! `rusqlite::Connection`, plain blocking calls, `params!` macros, JSON
//! columns for structured payloads.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use super::{JobListFilter, JobPage, Store};
use crate::error::StoreError;
use crate::model::{
    ApprovalRequest, ApprovalResolution, Job, JobAttempt, JobStatus, JobTypeDefinition,
    McpServerRecord, McpServerStatus, PreviewPayload, ProgressEvent, SafetyClass, Tool,
};

/// Shared handle to the sqlite connection. Short-lived local transactions
/// only, so a single mutex-guarded connection is sufficient — there is no
/// connection pool, matching the teacher's single-`Connection` `Database`.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL,
    payload TEXT NOT NULL,
    result TEXT,
    error TEXT,
    progress_percent INTEGER NOT NULL,
    current_stage TEXT,
    message TEXT,
    retry_count INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    scheduled_for TEXT NOT NULL,
    user_id TEXT NOT NULL,
    workspace_id TEXT,
    idempotency_key TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (status, scheduled_for);
CREATE INDEX IF NOT EXISTS idx_jobs_idempotency ON jobs (user_id, job_type, idempotency_key);

CREATE TABLE IF NOT EXISTS job_attempts (
    job_id TEXT NOT NULL,
    attempt_number INTEGER NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    error TEXT,
    PRIMARY KEY (job_id, attempt_number)
);

CREATE TABLE IF NOT EXISTS progress_events (
    job_id TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    data TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (job_id, sequence_number)
);

CREATE TABLE IF NOT EXISTS job_type_definitions (
    job_type TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    description TEXT NOT NULL,
    payload_schema TEXT,
    required_permissions TEXT,
    default_sandbox_profile TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS approval_requests (
    request_id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    arguments TEXT NOT NULL,
    safety_class TEXT NOT NULL,
    synthetic_reason TEXT,
    preview TEXT,
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    resolution TEXT
);
CREATE INDEX IF NOT EXISTS idx_approvals_conversation ON approval_requests (conversation_id);

CREATE TABLE IF NOT EXISTS mcp_servers (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    base_url TEXT NOT NULL,
    tools_url TEXT NOT NULL,
    tool_call_url_template TEXT NOT NULL,
    status TEXT NOT NULL,
    last_sync_at TEXT,
    last_error TEXT
);

CREATE TABLE IF NOT EXISTS mcp_tools (
    server_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    parameters TEXT NOT NULL,
    safety_class TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    stale INTEGER NOT NULL,
    source_hash TEXT NOT NULL,
    version TEXT NOT NULL,
    PRIMARY KEY (user_id, name)
);

CREATE TABLE IF NOT EXISTS conversation_event_guards (
    conversation_id TEXT NOT NULL,
    guard_kind TEXT NOT NULL,
    event_id TEXT NOT NULL,
    PRIMARY KEY (conversation_id, guard_kind, event_id)
);
"#;

fn ts(v: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(v)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Sqlite(rusqlite::Error::ToSqlConversionFailure(Box::new(e))))
}

fn opt_ts(v: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    v.map(|s| ts(&s)).transpose()
}

fn job_from_row(row: &Row) -> rusqlite::Result<Job> {
    let status: String = row.get("status")?;
    let payload: String = row.get("payload")?;
    let result: Option<String> = row.get("result")?;
    let scheduled_for: String = row.get("scheduled_for")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let started_at: Option<String> = row.get("started_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;

    Ok(Job {
        id: row.get("id")?,
        job_type: row.get("job_type")?,
        status: status.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "status".into(), rusqlite::types::Type::Text)
        })?,
        priority: row.get("priority")?,
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get("error")?,
        progress_percent: row.get("progress_percent")?,
        current_stage: row.get("current_stage")?,
        message: row.get("message")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        scheduled_for: DateTime::parse_from_rfc3339(&scheduled_for)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        user_id: row.get("user_id")?,
        workspace_id: row.get("workspace_id")?,
        idempotency_key: row.get("idempotency_key")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        started_at: started_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))),
        completed_at: completed_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))),
    })
}

fn bind_job<'a>(job: &'a Job) -> (String, String, Option<String>) {
    (
        job.payload.to_string(),
        job.status.to_string(),
        job.result.as_ref().map(|v| v.to_string()),
    )
}

impl Store for SqliteStore {
    fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let (payload, status, result) = bind_job(job);
        conn.execute(
            "INSERT INTO jobs (id, job_type, status, priority, payload, result, error,
                progress_percent, current_stage, message, retry_count, max_retries,
                scheduled_for, user_id, workspace_id, idempotency_key, created_at,
                updated_at, started_at, completed_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
            params![
                job.id,
                job.job_type,
                status,
                job.priority,
                payload,
                result,
                job.error,
                job.progress_percent,
                job.current_stage,
                job.message,
                job.retry_count,
                job.max_retries,
                job.scheduled_for.to_rfc3339(),
                job.user_id,
                job.workspace_id,
                job.idempotency_key,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
                job.started_at.map(|d| d.to_rfc3339()),
                job.completed_at.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], job_from_row)
            .optional()?;
        Ok(job)
    }

    fn find_job_by_idempotency_key(
        &self,
        user_id: &str,
        job_type: &str,
        idempotency_key: &str,
    ) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                "SELECT * FROM jobs WHERE user_id = ?1 AND job_type = ?2 AND idempotency_key = ?3",
                params![user_id, job_type, idempotency_key],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    fn replace_job(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let (payload, status, result) = bind_job(job);
        conn.execute(
            "UPDATE jobs SET job_type=?2, status=?3, priority=?4, payload=?5, result=?6,
                error=?7, progress_percent=?8, current_stage=?9, message=?10,
                retry_count=?11, max_retries=?12, scheduled_for=?13, user_id=?14,
                workspace_id=?15, idempotency_key=?16, created_at=?17, updated_at=?18,
                started_at=?19, completed_at=?20
             WHERE id = ?1",
            params![
                job.id,
                job.job_type,
                status,
                job.priority,
                payload,
                result,
                job.error,
                job.progress_percent,
                job.current_stage,
                job.message,
                job.retry_count,
                job.max_retries,
                job.scheduled_for.to_rfc3339(),
                job.user_id,
                job.workspace_id,
                job.idempotency_key,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
                job.started_at.map(|d| d.to_rfc3339()),
                job.completed_at.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn claim_next_queued_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let candidate: Option<String> = conn
            .query_row(
                "SELECT id FROM jobs WHERE status = 'queued' AND scheduled_for <= ?1
                 ORDER BY priority DESC, created_at ASC LIMIT 1",
                params![now.to_rfc3339()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = candidate else {
            return Ok(None);
        };

        let updated = conn.execute(
            "UPDATE jobs SET status='running', started_at=?2, updated_at=?2,
                message='Starting execution' WHERE id = ?1 AND status = 'queued'",
            params![id, now.to_rfc3339()],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        let job = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], job_from_row)
            .optional()?;
        Ok(job)
    }

    fn list_jobs(
        &self,
        user_id: &str,
        filter: &JobListFilter,
        page: u32,
        page_size: u32,
    ) -> Result<JobPage, StoreError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 100);
        let offset = ((page - 1) * page_size) as i64;
        let conn = self.conn.lock().unwrap();

        const WHERE: &str = "WHERE user_id = ?1
            AND (?2 IS NULL OR status = ?2)
            AND (?3 IS NULL OR job_type = ?3)";
        let status_param = filter.status.map(|s| s.to_string());
        let type_param = filter.job_type.clone();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM jobs {WHERE}"),
            params![user_id, status_param, type_param],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM jobs {WHERE} ORDER BY created_at DESC LIMIT ?4 OFFSET ?5"
        ))?;
        let jobs: Vec<Job> = stmt
            .query_map(
                params![user_id, status_param, type_param, page_size, offset],
                job_from_row,
            )?
            .collect::<Result<_, _>>()?;

        let has_next = total as u64 > (offset as u64 + jobs.len() as u64);
        Ok(JobPage {
            jobs,
            total: total as u64,
            page,
            page_size,
            has_next,
        })
    }

    fn delete_job(&self, id: &str, user_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM jobs WHERE id = ?1 AND user_id = ?2
                AND status IN ('completed', 'failed', 'canceled')",
            params![id, user_id],
        )?;
        if deleted > 0 {
            conn.execute("DELETE FROM job_attempts WHERE job_id = ?1", params![id])?;
            conn.execute("DELETE FROM progress_events WHERE job_id = ?1", params![id])?;
        }
        Ok(deleted > 0)
    }

    fn recover_stale_running_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE status = 'running'")?;
        let stale: Vec<Job> = stmt
            .query_map([], job_from_row)?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for job in &stale {
            conn.execute(
                "UPDATE jobs SET status='failed',
                    error=COALESCE(error, 'Job interrupted during restart'),
                    completed_at=?2, updated_at=?2,
                    message=COALESCE(message, 'Job interrupted')
                 WHERE id = ?1",
                params![job.id, now.to_rfc3339()],
            )?;
            conn.execute(
                "UPDATE job_attempts SET status='failed', completed_at=?2, error='Worker interrupted'
                 WHERE job_id = ?1 AND status = 'running'",
                params![job.id, now.to_rfc3339()],
            )?;
        }

        stale
            .into_iter()
            .map(|j| self.get_job(&j.id).map(|o| o.unwrap_or(j)))
            .collect()
    }

    fn create_attempt(&self, job_id: &str, started_at: DateTime<Utc>) -> Result<u32, StoreError> {
        let conn = self.conn.lock().unwrap();
        let max_attempt: i64 = conn.query_row(
            "SELECT COALESCE(MAX(attempt_number), 0) FROM job_attempts WHERE job_id = ?1",
            params![job_id],
            |r| r.get(0),
        )?;
        let attempt_number = max_attempt as u32 + 1;
        conn.execute(
            "INSERT INTO job_attempts (job_id, attempt_number, status, started_at)
             VALUES (?1,?2,'running',?3)",
            params![job_id, attempt_number, started_at.to_rfc3339()],
        )?;
        Ok(attempt_number)
    }

    fn complete_attempt(
        &self,
        job_id: &str,
        attempt_number: u32,
        status: JobStatus,
        completed_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE job_attempts SET status=?3, completed_at=?4, error=?5
             WHERE job_id = ?1 AND attempt_number = ?2",
            params![
                job_id,
                attempt_number,
                status.to_string(),
                completed_at.to_rfc3339(),
                error
            ],
        )?;
        Ok(())
    }

    fn fail_running_attempts(
        &self,
        job_id: &str,
        status: JobStatus,
        completed_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE job_attempts SET status=?2, completed_at=?3, error=?4
             WHERE job_id = ?1 AND status = 'running'",
            params![job_id, status.to_string(), completed_at.to_rfc3339(), error],
        )?;
        Ok(())
    }

    fn append_progress_event(
        &self,
        job_id: &str,
        event_type: &str,
        data: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<ProgressEvent, StoreError> {
        let conn = self.conn.lock().unwrap();
        let next_sequence: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM progress_events WHERE job_id = ?1",
            params![job_id],
            |r| r.get(0),
        )?;
        let sequence_number = next_sequence as u64 + 1;
        conn.execute(
            "INSERT INTO progress_events (job_id, sequence_number, event_type, data, timestamp)
             VALUES (?1,?2,?3,?4,?5)",
            params![
                job_id,
                sequence_number as i64,
                event_type,
                data.to_string(),
                timestamp.to_rfc3339()
            ],
        )?;
        Ok(ProgressEvent {
            job_id: job_id.to_string(),
            sequence_number,
            event_type: event_type.to_string(),
            data,
            timestamp,
        })
    }

    fn list_progress_events(
        &self,
        job_id: &str,
        since: Option<u64>,
    ) -> Result<Vec<ProgressEvent>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let since = since.unwrap_or(0) as i64;
        let mut stmt = conn.prepare(
            "SELECT job_id, sequence_number, event_type, data, timestamp FROM progress_events
             WHERE job_id = ?1 AND sequence_number > ?2 ORDER BY sequence_number ASC",
        )?;
        let events = stmt
            .query_map(params![job_id, since], |row| {
                let data: String = row.get("data")?;
                let timestamp: String = row.get("timestamp")?;
                Ok(ProgressEvent {
                    job_id: row.get("job_id")?,
                    sequence_number: row.get::<_, i64>("sequence_number")? as u64,
                    event_type: row.get("event_type")?,
                    data: serde_json::from_str(&data).unwrap_or(Value::Null),
                    timestamp: DateTime::parse_from_rfc3339(&timestamp)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(events)
    }

    fn upsert_job_type_definition(&self, def: &JobTypeDefinition) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_type_definitions
                (job_type, display_name, description, payload_schema, required_permissions, default_sandbox_profile)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(job_type) DO UPDATE SET
                display_name=excluded.display_name,
                description=excluded.description,
                payload_schema=excluded.payload_schema,
                required_permissions=excluded.required_permissions,
                default_sandbox_profile=excluded.default_sandbox_profile",
            params![
                def.job_type,
                def.display_name,
                def.description,
                def.payload_schema.as_ref().map(|v| v.to_string()),
                def.required_permissions
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
                def.default_sandbox_profile,
            ],
        )?;
        Ok(())
    }

    fn stage_approval(&self, request: &ApprovalRequest) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let has_unresolved: i64 = conn.query_row(
            "SELECT COUNT(*) FROM approval_requests WHERE conversation_id = ?1 AND resolved_at IS NULL",
            params![request.conversation_id],
            |r| r.get(0),
        )?;
        if has_unresolved > 0 {
            return Err(StoreError::Conflict);
        }
        conn.execute(
            "INSERT INTO approval_requests
                (request_id, conversation_id, tool_name, arguments, safety_class,
                 synthetic_reason, preview, created_at, resolved_at, resolution)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,NULL,NULL)",
            params![
                request.request_id,
                request.conversation_id,
                request.tool_name,
                request.arguments.to_string(),
                safety_class_str(request.safety_class),
                request.synthetic_reason,
                request
                    .preview
                    .as_ref()
                    .map(|p| serde_json::to_string(p).unwrap_or_default()),
                request.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_pending_approval(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM approval_requests WHERE conversation_id = ?1 AND resolved_at IS NULL",
            params![conversation_id],
            approval_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    fn get_approval(&self, request_id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM approval_requests WHERE request_id = ?1",
            params![request_id],
            approval_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    fn resolve_approval(
        &self,
        request_id: &str,
        resolution: ApprovalResolution,
        resolved_at: DateTime<Utc>,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE approval_requests SET resolved_at=?2, resolution=?3
             WHERE request_id = ?1 AND resolved_at IS NULL",
            params![
                request_id,
                resolved_at.to_rfc3339(),
                resolution_str(resolution)
            ],
        )?;
        conn.query_row(
            "SELECT * FROM approval_requests WHERE request_id = ?1",
            params![request_id],
            approval_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    fn upsert_tool(&self, tool: &Tool) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let user_id: String = conn
            .query_row(
                "SELECT user_id FROM mcp_servers WHERE id = ?1",
                params![tool.server_id],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or_default();
        conn.execute(
            "INSERT INTO mcp_tools
                (server_id, user_id, name, description, parameters, safety_class,
                 enabled, stale, source_hash, version)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
             ON CONFLICT(user_id, name) DO UPDATE SET
                server_id=excluded.server_id, description=excluded.description,
                parameters=excluded.parameters, safety_class=excluded.safety_class,
                enabled=excluded.enabled, stale=excluded.stale,
                source_hash=excluded.source_hash, version=excluded.version",
            params![
                tool.server_id,
                user_id,
                tool.name,
                tool.description,
                tool.parameters.to_string(),
                safety_class_str(tool.safety_class),
                tool.enabled,
                tool.stale,
                tool.source_hash,
                tool.version,
            ],
        )?;
        Ok(())
    }

    fn mark_tools_stale_except(
        &self,
        server_id: &str,
        active_names: &[String],
    ) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, enabled, stale FROM mcp_tools WHERE server_id = ?1",
        )?;
        let rows: Vec<(String, bool, bool)> = stmt
            .query_map(params![server_id], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let mut count = 0;
        for (name, enabled, stale) in rows {
            if active_names.contains(&name) {
                continue;
            }
            if !stale || enabled {
                count += 1;
            }
            conn.execute(
                "UPDATE mcp_tools SET stale = 1, enabled = 0 WHERE server_id = ?1 AND name = ?2",
                params![server_id, name],
            )?;
        }
        Ok(count)
    }

    fn get_enabled_tool(&self, user_id: &str, name: &str) -> Result<Option<Tool>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM mcp_tools WHERE user_id = ?1 AND name = ?2 AND enabled = 1 AND stale = 0",
            params![user_id, name],
            tool_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    fn list_enabled_tools(&self, user_id: &str) -> Result<Vec<Tool>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM mcp_tools WHERE user_id = ?1 AND enabled = 1 AND stale = 0 ORDER BY name ASC",
        )?;
        let tools = stmt
            .query_map(params![user_id], tool_from_row)?
            .collect::<Result<_, _>>()?;
        Ok(tools)
    }

    fn upsert_server(&self, server: &McpServerRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO mcp_servers
                (id, user_id, base_url, tools_url, tool_call_url_template, status, last_sync_at, last_error)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(id) DO UPDATE SET
                base_url=excluded.base_url, tools_url=excluded.tools_url,
                tool_call_url_template=excluded.tool_call_url_template,
                status=excluded.status, last_sync_at=excluded.last_sync_at,
                last_error=excluded.last_error",
            params![
                server.id,
                server.user_id,
                server.base_url,
                server.tools_url,
                server.tool_call_url_template,
                server_status_str(server.status),
                server.last_sync_at.map(|d| d.to_rfc3339()),
                server.last_error,
            ],
        )?;
        Ok(())
    }

    fn list_servers(&self, user_id: &str) -> Result<Vec<McpServerRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM mcp_servers WHERE user_id = ?1")?;
        let servers = stmt
            .query_map(params![user_id], server_from_row)?
            .collect::<Result<_, _>>()?;
        Ok(servers)
    }

    fn get_server(&self, id: &str) -> Result<Option<McpServerRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM mcp_servers WHERE id = ?1", params![id], server_from_row)
            .optional()
            .map_err(StoreError::from)
    }

    fn observe_conversation_event(
        &self,
        conversation_id: &str,
        guard_kind: &str,
        event_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO conversation_event_guards (conversation_id, guard_kind, event_id)
             VALUES (?1,?2,?3)",
            params![conversation_id, guard_kind, event_id],
        )?;
        Ok(inserted == 1)
    }
}

fn safety_class_str(class: SafetyClass) -> &'static str {
    match class {
        SafetyClass::ReadOnly => "read_only",
        SafetyClass::Mutating => "mutating",
    }
}

fn parse_safety_class(s: &str) -> SafetyClass {
    match s {
        "mutating" => SafetyClass::Mutating,
        _ => SafetyClass::ReadOnly,
    }
}

fn resolution_str(r: ApprovalResolution) -> &'static str {
    match r {
        ApprovalResolution::Approved => "approved",
        ApprovalResolution::Rejected => "rejected",
        ApprovalResolution::Expired => "expired",
    }
}

fn parse_resolution(s: &str) -> Option<ApprovalResolution> {
    match s {
        "approved" => Some(ApprovalResolution::Approved),
        "rejected" => Some(ApprovalResolution::Rejected),
        "expired" => Some(ApprovalResolution::Expired),
        _ => None,
    }
}

fn server_status_str(s: McpServerStatus) -> &'static str {
    match s {
        McpServerStatus::Registered => "registered",
        McpServerStatus::Healthy => "healthy",
        McpServerStatus::Error => "error",
    }
}

fn parse_server_status(s: &str) -> McpServerStatus {
    match s {
        "healthy" => McpServerStatus::Healthy,
        "error" => McpServerStatus::Error,
        _ => McpServerStatus::Registered,
    }
}

fn approval_from_row(row: &Row) -> rusqlite::Result<ApprovalRequest> {
    let arguments: String = row.get("arguments")?;
    let safety_class: String = row.get("safety_class")?;
    let preview: Option<String> = row.get("preview")?;
    let created_at: String = row.get("created_at")?;
    let resolved_at: Option<String> = row.get("resolved_at")?;
    let resolution: Option<String> = row.get("resolution")?;

    Ok(ApprovalRequest {
        request_id: row.get("request_id")?,
        conversation_id: row.get("conversation_id")?,
        tool_name: row.get("tool_name")?,
        arguments: serde_json::from_str(&arguments).unwrap_or(Value::Null),
        safety_class: parse_safety_class(&safety_class),
        synthetic_reason: row.get("synthetic_reason")?,
        preview: preview.and_then(|p| serde_json::from_str::<PreviewPayload>(&p).ok()),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        resolved_at: opt_ts(resolved_at).unwrap_or(None),
        resolution: resolution.and_then(|r| parse_resolution(&r)),
    })
}

fn tool_from_row(row: &Row) -> rusqlite::Result<Tool> {
    let parameters: String = row.get("parameters")?;
    let safety_class: String = row.get("safety_class")?;
    Ok(Tool {
        name: row.get("name")?,
        description: row.get("description")?,
        parameters: serde_json::from_str(&parameters).unwrap_or(Value::Null),
        safety_class: parse_safety_class(&safety_class),
        enabled: row.get("enabled")?,
        stale: row.get("stale")?,
        server_id: row.get("server_id")?,
        source_hash: row.get("source_hash")?,
        version: row.get("version")?,
    })
}

fn server_from_row(row: &Row) -> rusqlite::Result<McpServerRecord> {
    let status: String = row.get("status")?;
    let last_sync_at: Option<String> = row.get("last_sync_at")?;
    Ok(McpServerRecord {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        base_url: row.get("base_url")?,
        tools_url: row.get("tools_url")?,
        tool_call_url_template: row.get("tool_call_url_template")?,
        status: parse_server_status(&status),
        last_sync_at: last_sync_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))),
        last_error: row.get("last_error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobStatus;

    fn sample_job(id: &str, user: &str) -> Job {
        let now = Utc::now();
        Job {
            id: id.to_string(),
            job_type: "system.sleep".to_string(),
            status: JobStatus::Queued,
            priority: 0,
            payload: serde_json::json!({"seconds": 1}),
            result: None,
            error: None,
            progress_percent: 0,
            current_stage: None,
            message: None,
            retry_count: 0,
            max_retries: 3,
            scheduled_for: now,
            user_id: user.to_string(),
            workspace_id: None,
            idempotency_key: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn round_trips_a_job() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = sample_job("job-1", "user-1");
        store.insert_job(&job).unwrap();
        let fetched = store.get_job("job-1").unwrap().unwrap();
        assert_eq!(fetched.id, "job-1");
        assert_eq!(fetched.status, JobStatus::Queued);
        assert_eq!(fetched.payload, serde_json::json!({"seconds": 1}));
    }

    #[test]
    fn claim_transitions_to_running_and_is_exclusive() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_job(&sample_job("job-1", "user-1")).unwrap();
        let now = Utc::now();
        let claimed = store.claim_next_queued_job(now).unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(store.claim_next_queued_job(now).unwrap().is_none());
    }

    #[test]
    fn approval_ledger_rejects_second_unresolved_request() {
        let store = SqliteStore::open_in_memory().unwrap();
        let req = ApprovalRequest {
            request_id: "r1".into(),
            conversation_id: "c1".into(),
            tool_name: "create_project".into(),
            arguments: serde_json::json!({}),
            safety_class: SafetyClass::Mutating,
            synthetic_reason: None,
            preview: None,
            created_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        };
        store.stage_approval(&req).unwrap();
        let mut second = req.clone();
        second.request_id = "r2".into();
        let err = store.stage_approval(&second).unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }
}
