use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `read_only` tools are safe to execute without approval; `mutating`
/// tools must pass through the `ApprovalLedger` (§4.2/§4.5) unless the
/// active tool profile auto-approves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyClass {
    ReadOnly,
    Mutating,
}

/// A tool discovered from an MCP server and normalized for the provider.
///
/// Invariant: a tool is callable only if `enabled && !stale`
/// (`ToolRegistry::resolve` enforces this; see `crate::tools`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub safety_class: SafetyClass,
    pub enabled: bool,
    pub stale: bool,
    pub server_id: String,
    /// SHA-256 of the canonical-JSON-encoded `{type:"function", function:{..}}`
    /// envelope — see `crate::tools::hash::compute_tool_hash`.
    pub source_hash: String,
    /// First 12 hex chars of `source_hash`, derived not stored independently.
    pub version: String,
}

impl Tool {
    pub fn is_callable(&self) -> bool {
        self.enabled && !self.stale
    }

    /// The OpenAI-style function-call envelope passed to `ProviderAdapter`.
    pub fn as_function_schema(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// A registered MCP server: many tools are synced from one server.
/// Tools deleted upstream transition to `stale=true, enabled=false` but are
/// never removed immediately, preserving an audit trail (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerRecord {
    pub id: String,
    pub user_id: String,
    pub base_url: String,
    pub tools_url: String,
    pub tool_call_url_template: String,
    pub status: McpServerStatus,
    pub last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpServerStatus {
    Registered,
    Healthy,
    Error,
}

impl McpServerRecord {
    pub fn new(id: String, user_id: String, base_url: String) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            tools_url: format!("{base_url}/tools"),
            tool_call_url_template: "/tool:{name}".to_string(),
            status: McpServerStatus::Registered,
            last_sync_at: None,
            last_error: None,
            id,
            user_id,
            base_url,
        }
    }
}
