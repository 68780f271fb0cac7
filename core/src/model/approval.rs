use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The markdown-diff preview shown alongside a staged `preview_markdown_change`
/// tool call, carried verbatim in the approval request (§4.5 Approval UX
/// contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewPayload {
    #[serde(rename = "previewTool")]
    pub preview_tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_truncated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_notice: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalResolution {
    Approved,
    Rejected,
    Expired,
}

/// A pending (or resolved) mutating-tool-call approval request.
///
/// Invariant: at most one request per conversation has `resolved_at = None`
/// — enforced by `ApprovalLedger::stage` (§3, §8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub conversation_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub safety_class: crate::model::SafetyClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<PreviewPayload>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ApprovalResolution>,
}

impl ApprovalRequest {
    pub fn is_unresolved(&self) -> bool {
        self.resolved_at.is_none()
    }
}
