//! Core library for BrainDrive's tool-calling orchestrator and background
//! job manager: AI chat turns, MCP tool registry and invocation, the mutating
//! tool-call approval gate, and a durable job queue.
//!
//! This crate has no HTTP surface of its own — `braindrive-server` is a thin
//! axum layer over [`ToolLoop`] and [`JobManager`].

pub mod approval;
pub mod clock;
pub mod delivery;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod provider;
pub mod store;
pub mod tools;

use std::sync::Arc;
use std::time::Duration;

pub use approval::{ApprovalLedger, ApprovalLedgerConfig};
pub use clock::{Clock, SystemClock};
pub use delivery::{DeliveryOutbox, NullDeliveryOutbox};
pub use jobs::{JobManager, JobManagerConfig};
pub use orchestrator::{ToolLoop, ToolLoopConfig};
pub use provider::AiProvider;
pub use store::Store;
pub use tools::ToolRegistry;

/// Top-level composition root wiring the store, clock, and per-component
/// configs into the pieces a caller (the `server` crate, a CLI, a test
/// harness) actually drives. Mirrors the teacher's `AppState` shape: one
/// struct built once at startup, cloned cheaply via `Arc` fields.
pub struct AppContext {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub tools: Arc<ToolRegistry>,
    pub approvals: Arc<ApprovalLedger>,
    pub jobs: Arc<JobManager>,
    pub delivery: Arc<dyn DeliveryOutbox>,
    pub tool_loop_config: ToolLoopConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub approval: ApprovalLedgerConfig,
    pub job_manager: JobManagerConfig,
    pub tool_loop: ToolLoopConfig,
    pub tool_call_timeout: Duration,
    pub service_token: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            approval: ApprovalLedgerConfig::default(),
            job_manager: JobManagerConfig::default(),
            tool_loop: ToolLoopConfig::default(),
            tool_call_timeout: Duration::from_secs(15),
            service_token: std::env::var("BRAINDRIVE_SERVICE_TOKEN").ok(),
        }
    }
}

impl AppContext {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: AppConfig) -> Self {
        let tools = Arc::new(ToolRegistry::new(
            Arc::clone(&store),
            config.tool_call_timeout,
            config.service_token.clone(),
        ));
        let approvals = Arc::new(ApprovalLedger::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.approval,
        ));
        let jobs = Arc::new(JobManager::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.job_manager,
        ));
        Self {
            store,
            clock,
            tools,
            approvals,
            jobs,
            delivery: Arc::new(NullDeliveryOutbox),
            tool_loop_config: config.tool_loop,
        }
    }

    /// Overrides the default `NullDeliveryOutbox` with a real digest
    /// destination. Deployment concern, the way `ProviderResolver` lives
    /// outside the core.
    pub fn with_delivery(mut self, delivery: Arc<dyn DeliveryOutbox>) -> Self {
        self.delivery = delivery;
        self
    }

    /// Builds a `ToolLoop` bound to this context's tools/approvals/store and
    /// the caller-supplied provider. Providers are per-conversation (model
    /// choice can vary by request) so they aren't owned by the context
    /// itself.
    pub fn tool_loop(&self, provider: Arc<dyn AiProvider>) -> ToolLoop {
        ToolLoop::new(
            provider,
            Arc::clone(&self.tools),
            Arc::clone(&self.approvals),
            Arc::clone(&self.store),
            Arc::clone(&self.delivery),
            self.tool_loop_config,
        )
    }
}
