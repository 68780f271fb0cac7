use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{JobListFilter, JobPage, Store};
use crate::error::StoreError;
use crate::model::{
    ApprovalRequest, ApprovalResolution, Job, JobAttempt, JobStatus, JobTypeDefinition,
    McpServerRecord, ProgressEvent, Tool,
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    attempts: HashMap<String, Vec<JobAttempt>>,
    progress: HashMap<String, Vec<ProgressEvent>>,
    job_types: HashMap<String, JobTypeDefinition>,
    approvals: HashMap<String, ApprovalRequest>,
    tools: HashMap<String, Tool>,
    servers: HashMap<String, McpServerRecord>,
    conversation_events: HashSet<(String, String, String)>,
}

/// In-memory `Store` used by tests. No IO, single-process, guarded by a
/// plain `Mutex` since every operation here is a short in-memory mutation.
#[derive(Default)]
pub struct MemoryStore(Mutex<Inner>);

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn tool_key(user_id: &str, name: &str) -> String {
    format!("{user_id}\u{0}{name}")
}

impl Store for MemoryStore {
    fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.0.lock().unwrap();
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.0.lock().unwrap().jobs.get(id).cloned())
    }

    fn find_job_by_idempotency_key(
        &self,
        user_id: &str,
        job_type: &str,
        idempotency_key: &str,
    ) -> Result<Option<Job>, StoreError> {
        let inner = self.0.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .find(|j| {
                j.user_id == user_id
                    && j.job_type == job_type
                    && j.idempotency_key.as_deref() == Some(idempotency_key)
            })
            .cloned())
    }

    fn replace_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.0.lock().unwrap();
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn claim_next_queued_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut inner = self.0.lock().unwrap();
        let candidate_id = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && j.scheduled_for <= now)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|j| j.id.clone());

        let Some(id) = candidate_id else {
            return Ok(None);
        };

        let job = inner.jobs.get_mut(&id).unwrap();
        // Re-check status under the lock: this models the unique row-update
        // semantics of the SQL claim (§4.6).
        if job.status != JobStatus::Queued {
            return Ok(None);
        }
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.updated_at = now;
        job.message = Some("Starting execution".to_string());
        Ok(Some(job.clone()))
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
        let inner = self.0.lock().unwrap();

        let mut matching: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .filter(|j| filter.status.map(|s| s == j.status).unwrap_or(true))
            .filter(|j| {
                filter
                    .job_type
                    .as_deref()
                    .map(|t| t == j.job_type)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let offset = ((page - 1) * page_size) as usize;
        let jobs: Vec<Job> = matching
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .collect();
        let has_next = total > (offset + jobs.len()) as u64;

        Ok(JobPage {
            jobs,
            total,
            page,
            page_size,
            has_next,
        })
    }

    fn delete_job(&self, id: &str, user_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.0.lock().unwrap();
        let Some(job) = inner.jobs.get(id) else {
            return Ok(false);
        };
        if job.user_id != user_id || !job.status.is_terminal() {
            return Ok(false);
        }
        inner.jobs.remove(id);
        inner.attempts.remove(id);
        inner.progress.remove(id);
        Ok(true)
    }

    fn recover_stale_running_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut inner = self.0.lock().unwrap();
        let stale_ids: Vec<String> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| j.id.clone())
            .collect();

        let mut recovered = Vec::new();
        for id in stale_ids {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.status = JobStatus::Failed;
                if job.error.is_none() {
                    job.error = Some("Job interrupted during restart".to_string());
                }
                job.completed_at = Some(now);
                job.updated_at = now;
                if job.message.is_none() {
                    job.message = Some("Job interrupted".to_string());
                }
                recovered.push(job.clone());
            }
        }
        Ok(recovered)
    }

    fn create_attempt(&self, job_id: &str, started_at: DateTime<Utc>) -> Result<u32, StoreError> {
        let mut inner = self.0.lock().unwrap();
        let attempts = inner.attempts.entry(job_id.to_string()).or_default();
        let attempt_number = attempts.iter().map(|a| a.attempt_number).max().unwrap_or(0) + 1;
        attempts.push(JobAttempt {
            job_id: job_id.to_string(),
            attempt_number,
            status: JobStatus::Running,
            started_at,
            completed_at: None,
            error: None,
        });
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
        let mut inner = self.0.lock().unwrap();
        if let Some(attempts) = inner.attempts.get_mut(job_id) {
            if let Some(attempt) = attempts
                .iter_mut()
                .find(|a| a.attempt_number == attempt_number)
            {
                attempt.status = status;
                attempt.completed_at = Some(completed_at);
                attempt.error = error;
            }
        }
        Ok(())
    }

    fn fail_running_attempts(
        &self,
        job_id: &str,
        status: JobStatus,
        completed_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.0.lock().unwrap();
        if let Some(attempts) = inner.attempts.get_mut(job_id) {
            for attempt in attempts
                .iter_mut()
                .filter(|a| a.status == JobStatus::Running)
            {
                attempt.status = status;
                attempt.completed_at = Some(completed_at);
                attempt.error = Some(error.to_string());
            }
        }
        Ok(())
    }

    fn append_progress_event(
        &self,
        job_id: &str,
        event_type: &str,
        data: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<ProgressEvent, StoreError> {
        let mut inner = self.0.lock().unwrap();
        let events = inner.progress.entry(job_id.to_string()).or_default();
        let sequence_number = events.last().map(|e| e.sequence_number).unwrap_or(0) + 1;
        let event = ProgressEvent {
            job_id: job_id.to_string(),
            sequence_number,
            event_type: event_type.to_string(),
            data,
            timestamp,
        };
        events.push(event.clone());
        Ok(event)
    }

    fn list_progress_events(
        &self,
        job_id: &str,
        since: Option<u64>,
    ) -> Result<Vec<ProgressEvent>, StoreError> {
        let inner = self.0.lock().unwrap();
        let events = inner
            .progress
            .get(job_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|e| since.map(|s| e.sequence_number > s).unwrap_or(true))
            .collect();
        Ok(events)
    }

    fn upsert_job_type_definition(&self, def: &JobTypeDefinition) -> Result<(), StoreError> {
        let mut inner = self.0.lock().unwrap();
        inner.job_types.insert(def.job_type.clone(), def.clone());
        Ok(())
    }

    fn stage_approval(&self, request: &ApprovalRequest) -> Result<(), StoreError> {
        let mut inner = self.0.lock().unwrap();
        let has_unresolved = inner
            .approvals
            .values()
            .any(|a| a.conversation_id == request.conversation_id && a.is_unresolved());
        if has_unresolved {
            return Err(StoreError::Conflict);
        }
        inner
            .approvals
            .insert(request.request_id.clone(), request.clone());
        Ok(())
    }

    fn get_pending_approval(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let inner = self.0.lock().unwrap();
        Ok(inner
            .approvals
            .values()
            .find(|a| a.conversation_id == conversation_id && a.is_unresolved())
            .cloned())
    }

    fn get_approval(&self, request_id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        Ok(self.0.lock().unwrap().approvals.get(request_id).cloned())
    }

    fn resolve_approval(
        &self,
        request_id: &str,
        resolution: ApprovalResolution,
        resolved_at: DateTime<Utc>,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let mut inner = self.0.lock().unwrap();
        let Some(request) = inner.approvals.get_mut(request_id) else {
            return Ok(None);
        };
        if request.resolved_at.is_none() {
            request.resolved_at = Some(resolved_at);
            request.resolution = Some(resolution);
        }
        Ok(Some(request.clone()))
    }

    fn upsert_tool(&self, tool: &Tool) -> Result<(), StoreError> {
        let mut inner = self.0.lock().unwrap();
        let owner = inner
            .servers
            .get(&tool.server_id)
            .map(|s| s.user_id.clone())
            .unwrap_or_default();
        inner
            .tools
            .insert(tool_key(&owner, &tool.name), tool.clone());
        Ok(())
    }

    fn mark_tools_stale_except(
        &self,
        server_id: &str,
        active_names: &[String],
    ) -> Result<usize, StoreError> {
        let mut inner = self.0.lock().unwrap();
        let mut count = 0;
        for tool in inner.tools.values_mut() {
            if tool.server_id != server_id || active_names.contains(&tool.name) {
                continue;
            }
            if !tool.stale || tool.enabled {
                count += 1;
            }
            tool.stale = true;
            tool.enabled = false;
        }
        Ok(count)
    }

    fn get_enabled_tool(&self, user_id: &str, name: &str) -> Result<Option<Tool>, StoreError> {
        let inner = self.0.lock().unwrap();
        Ok(inner
            .tools
            .get(&tool_key(user_id, name))
            .filter(|t| t.is_callable())
            .cloned())
    }

    fn list_enabled_tools(&self, user_id: &str) -> Result<Vec<Tool>, StoreError> {
        let inner = self.0.lock().unwrap();
        let mut tools: Vec<Tool> = inner
            .tools
            .values()
            .filter(|t| t.is_callable())
            .filter(|t| {
                inner
                    .servers
                    .get(&t.server_id)
                    .map(|s| s.user_id == user_id)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    fn upsert_server(&self, server: &McpServerRecord) -> Result<(), StoreError> {
        let mut inner = self.0.lock().unwrap();
        inner.servers.insert(server.id.clone(), server.clone());
        Ok(())
    }

    fn list_servers(&self, user_id: &str) -> Result<Vec<McpServerRecord>, StoreError> {
        let inner = self.0.lock().unwrap();
        Ok(inner
            .servers
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    fn get_server(&self, id: &str) -> Result<Option<McpServerRecord>, StoreError> {
        Ok(self.0.lock().unwrap().servers.get(id).cloned())
    }

    fn observe_conversation_event(
        &self,
        conversation_id: &str,
        guard_kind: &str,
        event_id: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.0.lock().unwrap();
        let key = (
            conversation_id.to_string(),
            guard_kind.to_string(),
            event_id.to_string(),
        );
        Ok(inner.conversation_events.insert(key))
    }
}
