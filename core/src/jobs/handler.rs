//! Job-handler interface (§4.7): `validate_payload`, `execute`, optional
//! `cleanup`, cooperative cancellation, and progress reporting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::clock::Clock;
use crate::error::JobError;
use crate::store::Store;

/// Sentinel returned by a handler that observed cancellation mid-execution.
#[derive(Debug, thiserror::Error)]
#[error("job canceled by user request")]
pub struct JobCanceledError;

/// Per-execution context passed to a handler: progress reporting and
/// cancellation observation. Shared cancel flag is owned by the
/// `JobManager`, not the context itself.
pub struct JobContext {
    job_id: String,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    cancel_flag: Arc<AtomicBool>,
}

impl JobContext {
    pub fn new(
        job_id: String,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        cancel_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            job_id,
            store,
            clock,
            cancel_flag,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Raises the cancellation sentinel if the flag is set. Handlers must
    /// call this periodically at safe suspension points.
    pub fn check_for_cancel(&self) -> Result<(), JobCanceledError> {
        if self.is_cancelled() {
            Err(JobCanceledError)
        } else {
            Ok(())
        }
    }

    pub fn report_progress(
        &self,
        percent: Option<u8>,
        stage: Option<&str>,
        message: Option<&str>,
        event_type: &str,
        data: Option<Value>,
    ) -> Result<(), JobError> {
        let mut job = self
            .store
            .get_job(&self.job_id)?
            .ok_or(JobError::NotFound)?;

        if let Some(p) = percent {
            job.progress_percent = p.min(100);
        }
        if let Some(s) = stage {
            job.current_stage = Some(s.to_string());
        }
        if let Some(m) = message {
            job.message = Some(m.to_string());
        }
        job.updated_at = self.clock.now_utc();
        self.store.replace_job(&job)?;

        self.store.append_progress_event(
            &self.job_id,
            event_type,
            data.unwrap_or(Value::Null),
            self.clock.now_utc(),
        )?;
        Ok(())
    }
}

/// Job execution outcome: handlers return arbitrary JSON on success.
pub type HandlerResult = Result<Value, HandlerError>;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Canceled(#[from] JobCanceledError),
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait HandlerRuntime: Send + Sync {
    fn job_type(&self) -> &'static str;

    fn validate_payload(&self, payload: &Value) -> Result<(), String>;

    async fn execute(&self, ctx: &JobContext, payload: Value) -> HandlerResult;

    async fn cleanup(&self, _ctx: &JobContext) {}
}

/// Reference handler grounded directly on `job_manager.py`'s own test
/// handler: sleeps for `payload.seconds`, reporting progress once per
/// second, honoring cancellation between ticks.
pub struct SleepJobHandler;

#[async_trait]
impl HandlerRuntime for SleepJobHandler {
    fn job_type(&self) -> &'static str {
        "system.sleep"
    }

    fn validate_payload(&self, payload: &Value) -> Result<(), String> {
        match payload.get("seconds").and_then(|v| v.as_u64()) {
            Some(_) => Ok(()),
            None => Err("payload.seconds must be a non-negative integer".to_string()),
        }
    }

    async fn execute(&self, ctx: &JobContext, payload: Value) -> HandlerResult {
        let seconds = payload
            .get("seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        for elapsed in 0..seconds {
            ctx.check_for_cancel()?;
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            let percent = (((elapsed + 1) as f64 / seconds.max(1) as f64) * 100.0) as u8;
            ctx.report_progress(
                Some(percent),
                Some("sleeping"),
                Some(&format!("slept {}/{} seconds", elapsed + 1, seconds)),
                "progress",
                None,
            )
            .map_err(|e| HandlerError::Failed(e.to_string()))?;
        }

        Ok(serde_json::json!({ "slept_seconds": seconds }))
    }
}
