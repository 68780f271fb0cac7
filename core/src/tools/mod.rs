//! Tool discovery, sync, and invocation against registered MCP servers
//! (§4.3). Grounded on `mcp_registry_service.py`'s `sync_server_tools` /
//! `resolve_tools_for_request` / `_validate_tool_arguments`, reshaped onto
//! the teacher's `tools::registry` result-envelope style.

mod hash;
mod validate;

pub use hash::compute_tool_hash;
pub use validate::validate_arguments;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::clock::new_id;
use crate::error::{StoreError, ToolError};
use crate::model::{McpServerRecord, SafetyClass, Tool};
use crate::store::Store;

const READ_ONLY_PREFIXES: &[&str] = &[
    "get",
    "list",
    "read",
    "search",
    "preview",
    "project_exists",
    "digest",
    "summarize",
];

const MUTATING_PREFIXES: &[&str] = &[
    "create", "write", "edit", "delete", "move", "copy", "rename", "update", "set", "append",
    "prepend", "complete", "reopen",
];

/// Anything matching neither list defaults to `read_only`, never an error.
pub fn infer_safety_class(tool_name: &str) -> SafetyClass {
    let lowered = tool_name.trim().to_lowercase();
    if MUTATING_PREFIXES.iter().any(|p| lowered.starts_with(p)) {
        return SafetyClass::Mutating;
    }
    SafetyClass::ReadOnly
}

/// Normalized `{type:"function", function:{name, description, parameters}}`
/// envelope, ready to hash and store.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedTool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl NormalizedTool {
    fn envelope(&self) -> Value {
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

/// Accepts `{data:{tools:[...]}}`, `{tools:[...]}`, or a bare array; each
/// entry may be OpenAI-style `{type, function}` or a bare function object.
pub fn normalize_tools_payload(payload: &Value) -> Vec<NormalizedTool> {
    let raw: &[Value] = match payload {
        Value::Object(map) => {
            if let Some(Value::Array(tools)) = map.get("data").and_then(|d| d.get("tools")) {
                tools
            } else if let Some(Value::Array(tools)) = map.get("tools") {
                tools
            } else {
                &[]
            }
        }
        Value::Array(tools) => tools,
        _ => &[],
    };

    raw.iter()
        .filter_map(|entry| {
            let entry = entry.as_object()?;
            let function_obj = match entry.get("function") {
                Some(Value::Object(f)) => f,
                _ => entry,
            };
            let name = function_obj.get("name")?.as_str()?.trim();
            if name.is_empty() {
                return None;
            }
            let description = function_obj
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("")
                .to_string();
            let parameters = match function_obj.get("parameters") {
                Some(p @ Value::Object(_)) => p.clone(),
                _ => serde_json::json!({"type": "object", "properties": {}}),
            };
            Some(NormalizedTool {
                name: name.to_string(),
                description,
                parameters,
            })
        })
        .collect()
}

/// `tool_call_url_template` defaults to `/tool:{name}`; an absolute rendered
/// template is returned as-is, otherwise joined onto `server.base_url`.
pub fn build_tool_call_url(server: &McpServerRecord, tool_name: &str) -> String {
    let mut template = server.tool_call_url_template.trim().to_string();
    if template.is_empty() {
        template = "/tool:{name}".to_string();
    }
    if !template.contains("{name}") {
        template = if template.ends_with('/') {
            format!("{template}tool:{{name}}")
        } else {
            format!("{template}/tool:{{name}}")
        };
    }

    let rendered = template.replace("{name}", tool_name);
    if rendered.starts_with("http://") || rendered.starts_with("https://") {
        return rendered;
    }
    format!(
        "{}/{}",
        server.base_url.trim_end_matches('/'),
        rendered.trim_start_matches('/')
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerSyncSummary {
    pub server_id: String,
    pub fetched_count: usize,
    pub upserted_count: usize,
    pub stale_disabled_count: usize,
    pub status: &'static str,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub user_id: String,
    pub server_count: usize,
    pub tool_upserts: usize,
    pub error_count: usize,
    pub servers: Vec<ServerSyncSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub ok: bool,
    pub latency_ms: u64,
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolResultError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResultError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Tool discovery, sync, and invocation. Holds no server-side state beyond
/// an HTTP client and a handle to the shared `Store`.
pub struct ToolRegistry {
    store: Arc<dyn Store>,
    http: Client,
    service_token: Option<String>,
}

impl ToolRegistry {
    pub fn new(store: Arc<dyn Store>, call_timeout: Duration, service_token: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(call_timeout)
            .build()
            .expect("reqwest client build");
        Self {
            store,
            http,
            service_token,
        }
    }

    /// Syncs every server registered for `user_id`. Best-effort per server —
    /// one server's failure does not abort the others.
    pub async fn sync(&self, user_id: &str) -> Result<SyncSummary, StoreError> {
        let servers = self.store.list_servers(user_id)?;
        let mut summaries = Vec::with_capacity(servers.len());
        let mut tool_upserts = 0;
        let mut error_count = 0;

        for server in servers {
            let summary = self.sync_server(&server).await;
            tool_upserts += summary.upserted_count;
            if summary.status != "healthy" {
                error_count += 1;
            }
            summaries.push(summary);
        }

        Ok(SyncSummary {
            user_id: user_id.to_string(),
            server_count: summaries.len(),
            tool_upserts,
            error_count,
            servers: summaries,
        })
    }

    async fn sync_server(&self, server: &McpServerRecord) -> ServerSyncSummary {
        let fetch = async {
            let response = self
                .http
                .get(&server.tools_url)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if !response.status().is_success() {
                return Err(format!("tools endpoint returned {}", response.status()));
            }
            response
                .json::<Value>()
                .await
                .map_err(|e| e.to_string())
        };

        match fetch.await {
            Ok(payload) => {
                let tools = normalize_tools_payload(&payload);
                let mut active_names = Vec::with_capacity(tools.len());
                for tool in &tools {
                    let envelope = tool.envelope();
                    let source_hash = compute_tool_hash(&envelope);
                    let version = source_hash[..12].to_string();
                    let record = Tool {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                        safety_class: infer_safety_class(&tool.name),
                        enabled: true,
                        stale: false,
                        server_id: server.id.clone(),
                        source_hash,
                        version,
                    };
                    if let Err(e) = self.store.upsert_tool(&record) {
                        warn!(server_id = %server.id, error = %e, "tool upsert failed");
                        continue;
                    }
                    active_names.push(tool.name.clone());
                }

                let stale_disabled_count = self
                    .store
                    .mark_tools_stale_except(&server.id, &active_names)
                    .unwrap_or(0);

                let mut updated = server.clone();
                updated.status = crate::model::McpServerStatus::Healthy;
                updated.last_error = None;
                let _ = self.store.upsert_server(&updated);

                info!(server_id = %server.id, fetched = tools.len(), "synced mcp tools");
                ServerSyncSummary {
                    server_id: server.id.clone(),
                    fetched_count: tools.len(),
                    upserted_count: active_names.len(),
                    stale_disabled_count,
                    status: "healthy",
                    error: None,
                }
            }
            Err(err) => {
                warn!(server_id = %server.id, error = %err, "mcp tool sync failed");
                let mut updated = server.clone();
                updated.status = crate::model::McpServerStatus::Error;
                updated.last_error = Some(err.clone());
                let _ = self.store.upsert_server(&updated);
                ServerSyncSummary {
                    server_id: server.id.clone(),
                    fetched_count: 0,
                    upserted_count: 0,
                    stale_disabled_count: 0,
                    status: "error",
                    error: Some(err),
                }
            }
        }
    }

    /// Returns only enabled, non-stale tools.
    pub fn resolve(&self, user_id: &str, tool_name: &str) -> Result<Option<Tool>, StoreError> {
        self.store.get_enabled_tool(user_id, tool_name)
    }

    pub fn get_server(&self, server_id: &str) -> Result<Option<McpServerRecord>, StoreError> {
        self.store.get_server(server_id)
    }

    /// Budget-aware selection for provider prompt injection: ordered by
    /// name, cut off at `max_tools` or `max_schema_bytes` of cumulative
    /// serialized schema, whichever comes first.
    pub fn select_for_budget(
        &self,
        user_id: &str,
        max_tools: usize,
        max_schema_bytes: usize,
    ) -> Result<Vec<Tool>, StoreError> {
        let mut tools = self.store.list_enabled_tools(user_id)?;
        tools.sort_by(|a, b| a.name.cmp(&b.name));

        let mut selected = Vec::new();
        let mut cumulative_bytes = 0usize;
        for tool in tools {
            if selected.len() >= max_tools {
                break;
            }
            let schema_bytes = tool.as_function_schema().to_string().len();
            if cumulative_bytes + schema_bytes > max_schema_bytes {
                break;
            }
            cumulative_bytes += schema_bytes;
            selected.push(tool);
        }
        Ok(selected)
    }

    /// Validates arguments, issues the HTTP call, and returns a result
    /// envelope — never an `Err`, matching the spec's `{ok, error?}` shape.
    pub async fn invoke(
        &self,
        user_id: &str,
        server: &McpServerRecord,
        tool: &Tool,
        arguments: &Value,
        request_id: Option<&str>,
    ) -> ToolResult {
        let started = std::time::Instant::now();

        if !tool.is_callable() {
            return ToolResult {
                ok: false,
                latency_ms: 0,
                http_status: None,
                data: None,
                error: Some(ToolResultError {
                    code: "TOOL_NOT_ALLOWED",
                    message: format!("tool '{}' is not enabled", tool.name),
                    details: None,
                }),
            };
        }

        if let Err(errors) = validate_arguments(&tool.parameters, arguments) {
            return ToolResult {
                ok: false,
                latency_ms: started.elapsed().as_millis() as u64,
                http_status: None,
                data: None,
                error: Some(ToolResultError {
                    code: "TOOL_ARGUMENTS_INVALID",
                    message: "tool arguments failed schema validation".to_string(),
                    details: Some(serde_json::json!({ "errors": errors })),
                }),
            };
        }

        let url = build_tool_call_url(server, &tool.name);
        let request_id = request_id.map(str::to_string).unwrap_or_else(new_id);

        let mut req = self
            .http
            .post(&url)
            .header("X-BrainDrive-User-Id", normalize_user_id(user_id))
            .header("X-BrainDrive-Request-Id", request_id)
            .json(arguments);
        if let Some(token) = &self.service_token {
            req = req.header("X-BrainDrive-Service-Token", token);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                let latency_ms = started.elapsed().as_millis() as u64;
                let body = response.json::<Value>().await.unwrap_or(Value::Null);
                if status.is_success() {
                    ToolResult {
                        ok: true,
                        latency_ms,
                        http_status: Some(status.as_u16()),
                        data: Some(body),
                        error: None,
                    }
                } else {
                    ToolResult {
                        ok: false,
                        latency_ms,
                        http_status: Some(status.as_u16()),
                        data: None,
                        error: Some(ToolResultError {
                            code: "TOOL_HTTP_ERROR",
                            message: format!("tool call failed with status {status}"),
                            details: Some(body),
                        }),
                    }
                }
            }
            Err(e) => ToolResult {
                ok: false,
                latency_ms: started.elapsed().as_millis() as u64,
                http_status: None,
                data: None,
                error: Some(ToolResultError {
                    code: "TOOL_EXECUTION_ERROR",
                    message: e.to_string(),
                    details: None,
                }),
            },
        }
    }
}

fn normalize_user_id(user_id: &str) -> String {
    user_id.replace('-', "")
}

impl From<ToolResultError> for ToolError {
    fn from(e: ToolResultError) -> Self {
        match e.code {
            "TOOL_NOT_ALLOWED" => ToolError::NotAllowed(e.message),
            "TOOL_HTTP_ERROR" => ToolError::HttpError {
                status: 0,
                body: e.details.unwrap_or(Value::Null),
            },
            _ => ToolError::ExecutionError(e.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_mutating_prefix() {
        assert_eq!(infer_safety_class("create_project"), SafetyClass::Mutating);
        assert_eq!(infer_safety_class("delete_page"), SafetyClass::Mutating);
    }

    #[test]
    fn infers_read_only_prefix_and_default() {
        assert_eq!(infer_safety_class("list_pages"), SafetyClass::ReadOnly);
        assert_eq!(infer_safety_class("frobnicate"), SafetyClass::ReadOnly);
    }

    #[test]
    fn normalizes_bare_array_and_function_shapes() {
        let payload = serde_json::json!([
            {"type": "function", "function": {"name": "get_page", "parameters": {"type": "object"}}},
            {"name": "create_page"}
        ]);
        let tools = normalize_tools_payload(&payload);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[1].name, "create_page");
        assert_eq!(tools[1].parameters, serde_json::json!({"type": "object", "properties": {}}));
    }

    #[test]
    fn build_url_joins_relative_template_onto_base() {
        let server = McpServerRecord::new(
            "srv-1".into(),
            "user-1".into(),
            "http://localhost:9001/".into(),
        );
        let url = build_tool_call_url(&server, "create_project");
        assert_eq!(url, "http://localhost:9001/tool:create_project");
    }

    #[test]
    fn build_url_passes_through_absolute_template() {
        let mut server = McpServerRecord::new("srv-1".into(), "user-1".into(), "http://host".into());
        server.tool_call_url_template = "https://other-host/call/{name}".into();
        let url = build_tool_call_url(&server, "get_page");
        assert_eq!(url, "https://other-host/call/get_page");
    }
}
