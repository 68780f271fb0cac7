//! Wire and persistence types shared across components.
//!
//! These are plain data — no IO, no behavior beyond small invariant helpers.
//! Conversations and messages are opaque to the core except as keys; they
//! are stored by surrounding infrastructure (§3 of the spec).

mod approval;
mod conversation;
mod job;
mod tool;

pub use approval::{ApprovalRequest, ApprovalResolution, PreviewPayload};
pub use conversation::{Conversation, Message, MessageRole, ToolCall};
pub use job::{
    Job, JobAttempt, JobStatus, JobTypeDefinition, ProgressEvent, TERMINAL_JOB_STATES,
};
pub use tool::{McpServerRecord, SafetyClass, Tool};
