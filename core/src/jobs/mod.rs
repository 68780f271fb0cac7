//! Durable single-process job queue (§4.6): claim, attempts, idempotency,
//! retry, cancellation, progress events. Grounded directly on
//! `job_manager.py` — the worker loop, claim algorithm, and idempotency
//! branch below mirror its control flow line for line where the spec
//! leaves the detail implicit.

pub mod handler;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::{new_id, Clock};
use crate::error::JobError;
use crate::jobs::handler::{HandlerError, HandlerRuntime, JobContext};
use crate::model::{Job, JobStatus, JobTypeDefinition};
use crate::store::{JobListFilter, JobPage, Store};

#[derive(Debug, Clone, Copy)]
pub struct JobManagerConfig {
    pub poll_interval: Duration,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobTypeMeta {
    pub display_name: String,
    pub description: String,
    pub payload_schema: Option<Value>,
    pub required_permissions: Option<Vec<String>>,
    pub default_sandbox_profile: String,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: i64,
    pub workspace_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub max_retries: Option<u32>,
    pub scheduled_for: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone)]
pub struct EnqueueResult {
    pub job: Job,
    pub created: bool,
}

struct Registered {
    handler: Arc<dyn HandlerRuntime>,
}

pub struct JobManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: JobManagerConfig,
    handlers: Mutex<HashMap<String, Registered>>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: JobManagerConfig) -> Self {
        Self {
            store,
            clock,
            config,
            handlers: Mutex::new(HashMap::new()),
            cancel_flags: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
        }
    }

    /// Persists the type's metadata every time a handler is registered, so
    /// it survives restarts independent of which handlers are loaded.
    pub fn register_handler(
        &self,
        handler: Arc<dyn HandlerRuntime>,
        meta: JobTypeMeta,
    ) -> Result<(), JobError> {
        let job_type = handler.job_type().to_string();
        self.store.upsert_job_type_definition(&JobTypeDefinition {
            job_type: job_type.clone(),
            display_name: meta.display_name,
            description: meta.description,
            payload_schema: meta.payload_schema,
            required_permissions: meta.required_permissions,
            default_sandbox_profile: meta.default_sandbox_profile,
        })?;
        self.handlers
            .lock()
            .unwrap()
            .insert(job_type, Registered { handler });
        Ok(())
    }

    /// Idempotent: calling `start` while a worker is already running is a
    /// no-op. Always runs stale-job recovery first, not just on first boot.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }

        if let Err(e) = self.recover_stale_jobs() {
            error!(error = %e, "failed to recover stale jobs at startup");
        }

        let manager = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            manager.worker_loop().await;
        }));
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn recover_stale_jobs(&self) -> Result<(), JobError> {
        let now = self.clock.now_utc();
        let recovered = self.store.recover_stale_running_jobs(now)?;
        for job in &recovered {
            warn!(job_id = %job.id, "recovered stale running job as failed");
        }
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            match self.try_claim_and_run().await {
                Ok(true) => continue,
                Ok(false) => tokio::time::sleep(self.config.poll_interval).await,
                Err(e) => {
                    error!(error = %e, "job worker iteration failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn try_claim_and_run(&self) -> Result<bool, JobError> {
        let now = self.clock.now_utc();
        let Some(job) = self.store.claim_next_queued_job(now)? else {
            return Ok(false);
        };
        self.run_claimed_job(job).await?;
        Ok(true)
    }

    async fn run_claimed_job(&self, mut job: Job) -> Result<(), JobError> {
        let handler = {
            let handlers = self.handlers.lock().unwrap();
            handlers.get(&job.job_type).map(|r| Arc::clone(&r.handler))
        };
        let Some(handler) = handler else {
            job.status = JobStatus::Failed;
            job.error = Some(format!("no handler registered for job_type={}", job.job_type));
            job.completed_at = Some(self.clock.now_utc());
            job.updated_at = self.clock.now_utc();
            self.store.replace_job(&job)?;
            return Ok(());
        };

        let attempt_number = self.store.create_attempt(&job.id, self.clock.now_utc())?;
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .unwrap()
            .insert(job.id.clone(), Arc::clone(&cancel_flag));

        let ctx = JobContext::new(
            job.id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&cancel_flag),
        );

        let outcome = handler.execute(&ctx, job.payload.clone()).await;
        handler.cleanup(&ctx).await;
        self.cancel_flags.lock().unwrap().remove(&job.id);

        let now = self.clock.now_utc();
        match outcome {
            Ok(result) => {
                job.status = JobStatus::Completed;
                job.result = Some(result);
                job.progress_percent = 100;
                job.completed_at = Some(now);
                job.updated_at = now;
                self.store.replace_job(&job)?;
                self.store
                    .complete_attempt(&job.id, attempt_number, JobStatus::Completed, now, None)?;
                info!(job_id = %job.id, "job completed");
            }
            Err(HandlerError::Canceled(_)) => {
                job.status = JobStatus::Canceled;
                job.completed_at = Some(now);
                job.updated_at = now;
                self.store.replace_job(&job)?;
                self.store
                    .complete_attempt(&job.id, attempt_number, JobStatus::Canceled, now, None)?;
                self.store.append_progress_event(
                    &job.id,
                    "canceled",
                    serde_json::json!({ "reason": "cooperative cancel observed" }),
                    now,
                )?;
                info!(job_id = %job.id, "job canceled");
            }
            Err(HandlerError::Failed(message)) => {
                job.status = JobStatus::Failed;
                job.error = Some(message.clone());
                job.completed_at = Some(now);
                job.updated_at = now;
                self.store.replace_job(&job)?;
                self.store.complete_attempt(
                    &job.id,
                    attempt_number,
                    JobStatus::Failed,
                    now,
                    Some(message),
                )?;
                warn!(job_id = %job.id, "job failed");
            }
        }
        Ok(())
    }

    /// `(user, type, idempotency_key)` collision handling (§4.6 + the
    /// original source's reset-in-place branch).
    pub fn enqueue_job(
        &self,
        job_type: &str,
        payload: Value,
        user_id: &str,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult, JobError> {
        let handler = {
            let handlers = self.handlers.lock().unwrap();
            handlers.get(job_type).map(|r| Arc::clone(&r.handler))
        };
        let Some(handler) = handler else {
            return Err(JobError::HandlerNotRegistered(job_type.to_string()));
        };
        handler
            .validate_payload(&payload)
            .map_err(JobError::PayloadInvalid)?;

        if let Some(key) = &options.idempotency_key {
            if let Some(existing) = self
                .store
                .find_job_by_idempotency_key(user_id, job_type, key)?
            {
                if !existing.status.is_terminal() {
                    return Ok(EnqueueResult {
                        job: existing,
                        created: false,
                    });
                }
                if existing.status == JobStatus::Completed {
                    return Ok(EnqueueResult {
                        job: existing,
                        created: false,
                    });
                }

                let now = self.clock.now_utc();
                self.store.fail_running_attempts(
                    &existing.id,
                    JobStatus::Failed,
                    now,
                    "Superseded by retry",
                )?;

                let mut reset = existing;
                reset.status = JobStatus::Queued;
                reset.result = None;
                reset.error = None;
                reset.progress_percent = 0;
                reset.current_stage = None;
                reset.message = None;
                reset.retry_count += 1;
                reset.scheduled_for = now;
                reset.started_at = None;
                reset.completed_at = None;
                reset.updated_at = now;
                reset.payload = payload;
                self.store.replace_job(&reset)?;
                return Ok(EnqueueResult {
                    job: reset,
                    created: true,
                });
            }
        }

        let now = self.clock.now_utc();
        let job = Job {
            id: new_id(),
            job_type: job_type.to_string(),
            status: JobStatus::Queued,
            priority: options.priority,
            payload,
            result: None,
            error: None,
            progress_percent: 0,
            current_stage: None,
            message: None,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(3),
            scheduled_for: options.scheduled_for.unwrap_or(now),
            user_id: user_id.to_string(),
            workspace_id: options.workspace_id,
            idempotency_key: options.idempotency_key,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.store.insert_job(&job)?;
        Ok(EnqueueResult { job, created: true })
    }

    pub fn get_job(&self, id: &str) -> Result<Job, JobError> {
        self.store.get_job(id)?.ok_or(JobError::NotFound)
    }

    pub fn list_jobs(
        &self,
        user_id: &str,
        filter: &JobListFilter,
        page: u32,
        page_size: u32,
    ) -> Result<JobPage, JobError> {
        Ok(self.store.list_jobs(user_id, filter, page, page_size)?)
    }

    pub fn delete_job(&self, id: &str, user_id: &str) -> Result<bool, JobError> {
        Ok(self.store.delete_job(id, user_id)?)
    }

    /// `queued` jobs cancel immediately; `running` jobs set the in-memory
    /// flag and write a `cancel_requested` event — the transition to
    /// `canceled` happens only once the handler observes it (or the job
    /// happens to complete first, a real race this preserves).
    pub fn cancel_job(&self, id: &str) -> Result<Job, JobError> {
        let mut job = self.store.get_job(id)?.ok_or(JobError::NotFound)?;
        match job.status {
            JobStatus::Queued => {
                job.status = JobStatus::Canceled;
                job.completed_at = Some(self.clock.now_utc());
                job.updated_at = self.clock.now_utc();
                self.store.replace_job(&job)?;
                Ok(job)
            }
            JobStatus::Running => {
                if let Some(flag) = self.cancel_flags.lock().unwrap().get(id) {
                    flag.store(true, Ordering::SeqCst);
                }
                self.store.append_progress_event(
                    id,
                    "cancel_requested",
                    serde_json::json!({}),
                    self.clock.now_utc(),
                )?;
                Ok(job)
            }
            _ => Ok(job),
        }
    }

    /// Resets a failed/canceled job and requeues it. No-op for completed
    /// jobs.
    pub fn retry_job(&self, id: &str) -> Result<Job, JobError> {
        let mut job = self.store.get_job(id)?.ok_or(JobError::NotFound)?;
        if job.status == JobStatus::Completed {
            return Ok(job);
        }
        if !job.status.is_terminal() {
            return Ok(job);
        }

        let now = self.clock.now_utc();
        job.status = JobStatus::Queued;
        job.result = None;
        job.error = None;
        job.progress_percent = 0;
        job.current_stage = None;
        job.message = None;
        job.retry_count += 1;
        job.scheduled_for = now;
        job.started_at = None;
        job.completed_at = None;
        job.updated_at = now;
        self.store.replace_job(&job)?;
        Ok(job)
    }

    pub fn events(
        &self,
        id: &str,
        since: Option<u64>,
    ) -> Result<Vec<crate::model::ProgressEvent>, JobError> {
        Ok(self.store.list_progress_events(id, since)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::store::MemoryStore;

    fn manager() -> (Arc<JobManager>, Arc<FakeClock>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock = Arc::new(FakeClock::new(chrono::Utc::now()));
        let manager = Arc::new(JobManager::new(store, clock.clone(), JobManagerConfig::default()));
        manager
            .register_handler(
                Arc::new(handler::SleepJobHandler),
                JobTypeMeta {
                    display_name: "Sleep".to_string(),
                    description: "Sleeps for N seconds".to_string(),
                    payload_schema: None,
                    required_permissions: None,
                    default_sandbox_profile: "none".to_string(),
                },
            )
            .unwrap();
        (manager, clock)
    }

    #[test]
    fn enqueue_unknown_type_is_rejected() {
        let (manager, _clock) = manager();
        let err = manager
            .enqueue_job("does.not.exist", serde_json::json!({}), "user-1", EnqueueOptions::default())
            .unwrap_err();
        assert!(matches!(err, JobError::HandlerNotRegistered(_)));
    }

    #[test]
    fn idempotency_key_collapses_repeated_enqueue() {
        let (manager, _clock) = manager();
        let opts = EnqueueOptions {
            idempotency_key: Some("http://o|m1".to_string()),
            ..Default::default()
        };
        let first = manager
            .enqueue_job("system.sleep", serde_json::json!({"seconds": 1}), "user-1", opts.clone())
            .unwrap();
        assert!(first.created);

        let second = manager
            .enqueue_job("system.sleep", serde_json::json!({"seconds": 1}), "user-1", opts)
            .unwrap();
        assert!(!second.created);
        assert_eq!(first.job.id, second.job.id);
    }

    #[test]
    fn idempotency_key_resets_failed_terminal_job_and_bumps_retry_count() {
        let (manager, clock) = manager();
        let opts = EnqueueOptions {
            idempotency_key: Some("k1".to_string()),
            ..Default::default()
        };
        let first = manager
            .enqueue_job("system.sleep", serde_json::json!({"seconds": 0}), "user-1", opts.clone())
            .unwrap();

        let mut failed = manager.get_job(&first.job.id).unwrap();
        failed.status = JobStatus::Failed;
        failed.error = Some("boom".to_string());
        failed.completed_at = Some(clock.now_utc());
        manager.store.replace_job(&failed).unwrap();

        let reset = manager
            .enqueue_job("system.sleep", serde_json::json!({"seconds": 0}), "user-1", opts)
            .unwrap();
        assert!(reset.created);
        assert_eq!(reset.job.id, first.job.id);
        assert_eq!(reset.job.retry_count, 1);
        assert_eq!(reset.job.status, JobStatus::Queued);
    }

    #[test]
    fn cancel_on_queued_job_transitions_immediately() {
        let (manager, _clock) = manager();
        let enqueued = manager
            .enqueue_job("system.sleep", serde_json::json!({"seconds": 5}), "user-1", EnqueueOptions::default())
            .unwrap();
        let canceled = manager.cancel_job(&enqueued.job.id).unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
    }
}
