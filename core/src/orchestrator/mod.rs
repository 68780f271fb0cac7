//! The Tool-Calling Orchestrator core (§4.5) — the iteration loop that
//! drives a conversation through a provider, executes read-only tools
//! in-process, stages mutating tools behind the `ApprovalLedger`, injects
//! deterministic synthetic calls, and assembles the final turn.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::approval::{ApprovalLedger, NewApprovalRequest};
use crate::delivery::DeliveryOutbox;
use crate::model::{ApprovalResolution, Message, MessageRole, SafetyClass, ToolCall};
use crate::policy::{EffectivePolicy, SyntheticStep};
use crate::provider::{AiProvider, ChatParams, ChatRequest};
use crate::store::Store;
use crate::tools::ToolRegistry;

/// Byte-stable approval prompt. Any change here is an observable API break
/// (§4.5, §9 open questions) — tests assert this literal.
pub const APPROVAL_COPY: &str =
    "Approval required before executing mutating tool call. Reply `approve` to continue or `reject` to cancel.";

#[derive(Debug, Clone, Copy)]
pub struct ToolLoopConfig {
    pub max_iterations: u32,
    pub provider_timeout_seconds: u64,
    pub tool_call_timeout_seconds: u64,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 6,
            provider_timeout_seconds: 60,
            tool_call_timeout_seconds: 15,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApprovalAction {
    pub action: ApprovalActionKind,
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalActionKind {
    #[default]
    Approve,
    Reject,
}

#[derive(Debug, Clone, Default)]
pub struct TurnParams {
    pub chat: ChatParams,
    pub mcp_auto_approve_mutating: bool,
    pub mcp_approval: Option<ApprovalAction>,
    pub mcp_digest_force_run: bool,
    pub mcp_digest_schedule_event_id: Option<String>,
    pub mcp_pre_compaction_event_id: Option<String>,
}

pub struct TurnRequest {
    pub conversation_id: String,
    pub conversation_type: String,
    pub user_id: String,
    pub model: String,
    pub messages: Vec<Message>,
    pub policy: EffectivePolicy,
    pub params: TurnParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequestView {
    pub request_id: String,
    pub tool: String,
    pub arguments: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthetic_reason: Option<String>,
    pub safety_class: SafetyClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<crate::model::PreviewPayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalResolutionView {
    pub status: &'static str,
    pub request_id: String,
}

/// §4.5/§6 "delivery handoff": emitted on a successful terminal turn for a
/// digest conversation. Persistence goes through a `DeliveryOutbox`;
/// failures there are reflected in `delivery_record_status`, never in the
/// turn's own success.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryHandoff {
    pub channel: String,
    pub conversation_type: String,
    pub format: &'static str,
    pub body: String,
    pub delivery_record_status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_record_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolingState {
    pub tool_routing_mode: String,
    pub tool_execution_mode: String,
    pub tool_profile: String,
    pub tool_profile_source: String,
    pub tool_calls_executed_count: u32,
    pub tool_loop_stop_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_citations: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_citations_appended: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest_schedule_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest_schedule_duplicate_guard: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_compaction_flush_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_compaction_duplicate_guard: Option<String>,
    pub provider_timeout_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub message: Message,
    pub finish_reason: String,
    pub conversation_id: String,
    pub tooling_state: ToolingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_request: Option<ApprovalRequestView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_resolution: Option<ApprovalResolutionView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_handoff: Option<DeliveryHandoff>,
}

pub struct ToolLoop {
    provider: Arc<dyn AiProvider>,
    tools: Arc<ToolRegistry>,
    approvals: Arc<ApprovalLedger>,
    store: Arc<dyn Store>,
    delivery: Arc<dyn DeliveryOutbox>,
    config: ToolLoopConfig,
}

impl ToolLoop {
    pub fn new(
        provider: Arc<dyn AiProvider>,
        tools: Arc<ToolRegistry>,
        approvals: Arc<ApprovalLedger>,
        store: Arc<dyn Store>,
        delivery: Arc<dyn DeliveryOutbox>,
        config: ToolLoopConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            approvals,
            store,
            delivery,
            config,
        }
    }

    /// Entry point. Consults the digest-schedule and pre-compaction
    /// duplicate guards before anything else runs, then stamps their
    /// status onto whatever response the rest of the turn produces.
    pub async fn run(&self, request: TurnRequest) -> TurnResponse {
        if let Some(event_id) = request.params.mcp_digest_schedule_event_id.clone() {
            match self
                .store
                .observe_conversation_event(&request.conversation_id, "digest_schedule", &event_id)
            {
                Ok(true) => {}
                Ok(false) => return self.digest_duplicate_guard_response(&request),
                Err(e) => {
                    warn!(error = %e, "digest duplicate-guard store lookup failed");
                    return self.fatal_error_response(&request);
                }
            }
        }
        if let Some(event_id) = request.params.mcp_pre_compaction_event_id.clone() {
            match self
                .store
                .observe_conversation_event(&request.conversation_id, "pre_compaction", &event_id)
            {
                Ok(true) => {}
                Ok(false) => return self.pre_compaction_duplicate_guard_response(&request),
                Err(e) => {
                    warn!(error = %e, "pre-compaction duplicate-guard store lookup failed");
                    return self.fatal_error_response(&request);
                }
            }
        }

        let digest_event_present = request.params.mcp_digest_schedule_event_id.is_some();
        let pre_compaction_event_present = request.params.mcp_pre_compaction_event_id.is_some();

        let mut response = self.run_turn(request).await;

        if digest_event_present && response.tooling_state.digest_schedule_status.is_none() {
            response.tooling_state.digest_schedule_status = Some("triggered".to_string());
        }
        if pre_compaction_event_present && response.tooling_state.pre_compaction_flush_status.is_none() {
            response.tooling_state.pre_compaction_flush_status = Some("triggered".to_string());
        }
        response
    }

    async fn run_turn(&self, request: TurnRequest) -> TurnResponse {
        let mut messages = request.messages.clone();
        let mut tool_calls_executed = 0u32;
        let mut provider_timeout_count = 0u32;

        // Step 1: apply a pending approval resolution before anything else.
        if let Some(action) = &request.params.mcp_approval {
            match self.apply_resolution(&request.conversation_id, action).await {
                Ok(ResolutionOutcome::Rejected) => {
                    let message = Message::assistant(
                        "The requested action was rejected and will not be executed.",
                    );
                    return TurnResponse {
                        message,
                        finish_reason: "stop".to_string(),
                        conversation_id: request.conversation_id,
                        tooling_state: ToolingState {
                            tool_loop_stop_reason: "approval_required".to_string(),
                            ..Default::default()
                        },
                        approval_required: None,
                        approval_request: None,
                        approval_resolution: Some(ApprovalResolutionView {
                            status: "rejected",
                            request_id: action.request_id.clone(),
                        }),
                        delivery_handoff: None,
                    };
                }
                Ok(ResolutionOutcome::Approved {
                    tool_name,
                    arguments,
                    request_id,
                }) => {
                    tool_calls_executed += 1;
                    let result = self.invoke_read_only_or_mutating(&request.user_id, &tool_name, &arguments).await;
                    messages.push(Message::tool_result(
                        request_id.clone(),
                        serde_json::to_string(&result).unwrap_or_default(),
                    ));
                    // fallthrough to continue the loop below, recording the approval
                    return self
                        .continue_after_approval(request, messages, tool_calls_executed, request_id)
                        .await;
                }
                Err(_) => {
                    let message = Message::assistant("Approval resolution failed.");
                    return TurnResponse {
                        message,
                        finish_reason: "stop".to_string(),
                        conversation_id: request.conversation_id,
                        tooling_state: ToolingState {
                            tool_loop_stop_reason: "error".to_string(),
                            ..Default::default()
                        },
                        approval_required: None,
                        approval_request: None,
                        approval_resolution: None,
                        delivery_handoff: None,
                    };
                }
            }
        }

        // Synthetic injection happens only on a fresh turn (no approval in flight).
        if let Some(plan) = request.policy.synthetic_plan.clone() {
            if let Some(outcome) = self
                .run_synthetic_plan(&request, &plan, &mut messages, &mut tool_calls_executed)
                .await
            {
                return outcome;
            }
            // The plan ran to completion without suspending for approval: this
            // is the deterministic new-page/interview turn, and it never calls
            // the provider (§4.5 "guarantees deterministic scaffolding ...
            // irrespective of the underlying model").
            return self.deterministic_synthetic_response(&request, &plan, tool_calls_executed);
        }

        self.drive_iterations(
            request,
            messages,
            tool_calls_executed,
            &mut provider_timeout_count,
        )
        .await
    }

    async fn continue_after_approval(
        &self,
        request: TurnRequest,
        messages: Vec<Message>,
        tool_calls_executed: u32,
        request_id: String,
    ) -> TurnResponse {
        let mut provider_timeout_count = 0;
        let mut response = self
            .drive_iterations(request, messages, tool_calls_executed, &mut provider_timeout_count)
            .await;
        response.approval_resolution = Some(ApprovalResolutionView {
            status: "approved",
            request_id,
        });
        response
    }

    async fn run_synthetic_plan(
        &self,
        request: &TurnRequest,
        plan: &[SyntheticStep],
        messages: &mut Vec<Message>,
        tool_calls_executed: &mut u32,
    ) -> Option<TurnResponse> {
        for step in plan {
            let safety_class = crate::tools::infer_safety_class(&step.tool_name);
            if safety_class == SafetyClass::Mutating && !request.params.mcp_auto_approve_mutating {
                let staged = self.approvals.stage(NewApprovalRequest {
                    conversation_id: request.conversation_id.clone(),
                    tool_name: step.tool_name.clone(),
                    arguments: step.arguments.clone(),
                    safety_class,
                    synthetic_reason: Some(step.synthetic_reason.clone()),
                    preview: None,
                });
                return match staged {
                    Ok(req) => Some(self.approval_required_response(request, req)),
                    Err(_) => Some(self.fatal_error_response(request)),
                };
            }

            *tool_calls_executed += 1;
            let result = self
                .invoke_read_only_or_mutating(&request.user_id, &step.tool_name, &step.arguments)
                .await;
            messages.push(Message::tool_result(
                crate::clock::new_id(),
                serde_json::to_string(&result).unwrap_or_default(),
            ));
        }
        None
    }

    /// The turn produced once a synthetic plan runs to completion without
    /// suspending: deterministic by construction, so it never goes back to
    /// the provider.
    fn deterministic_synthetic_response(
        &self,
        request: &TurnRequest,
        plan: &[SyntheticStep],
        tool_calls_executed: u32,
    ) -> TurnResponse {
        let path = plan
            .last()
            .and_then(|step| step.arguments.get("path"))
            .and_then(Value::as_str)
            .unwrap_or("the new project");
        let content = format!("Scaffolded {path}. What would you like to capture first?");

        TurnResponse {
            message: Message::assistant(content),
            finish_reason: "stop".to_string(),
            conversation_id: request.conversation_id.clone(),
            tooling_state: ToolingState {
                tool_routing_mode: format!("{:?}", request.policy.routing_mode),
                tool_execution_mode: "native".to_string(),
                tool_profile: format!("{:?}", request.policy.tool_profile),
                tool_profile_source: "scope_policy".to_string(),
                tool_calls_executed_count: tool_calls_executed,
                tool_loop_stop_reason: "deterministic_new_page_interview_turn".to_string(),
                ..Default::default()
            },
            approval_required: None,
            approval_request: None,
            approval_resolution: None,
            delivery_handoff: None,
        }
    }

    async fn drive_iterations(
        &self,
        request: TurnRequest,
        mut messages: Vec<Message>,
        mut tool_calls_executed: u32,
        provider_timeout_count: &mut u32,
    ) -> TurnResponse {
        let mut stop_reason = "iteration_cap_reached";

        for _ in 0..self.config.max_iterations {
            let tools = self
                .tools
                .select_for_budget(&request.user_id, 32, 128 * 1024)
                .unwrap_or_default();
            let schemas: Vec<Value> = tools.iter().map(|t| t.as_function_schema()).collect();

            let chat_request = ChatRequest {
                model: request.model.clone(),
                messages: messages.clone(),
                params: request.params.chat.clone(),
                tools: schemas,
            };

            let chunk = match self.provider.chat_completion(chat_request).await {
                Ok(c) => c,
                Err(crate::provider::ProviderError::Timeout) => {
                    *provider_timeout_count += 1;
                    if *provider_timeout_count > 1 {
                        stop_reason = "provider_timeout";
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "provider call failed");
                    stop_reason = "error";
                    break;
                }
            };

            let tool_calls = chunk.tool_calls.unwrap_or_default();
            if tool_calls.is_empty() {
                let content = chunk.content.unwrap_or_default();
                messages.push(Message::assistant(content));
                stop_reason = "provider_final_response";
                break;
            }

            let (read_only, mutating): (Vec<ToolCall>, Vec<ToolCall>) = self.partition_calls(&tool_calls);

            for call in &read_only {
                tool_calls_executed += 1;
                let result = self
                    .invoke_read_only_or_mutating(&request.user_id, &call.name, &call.arguments)
                    .await;
                messages.push(Message::tool_result(
                    call.id.clone(),
                    serde_json::to_string(&result).unwrap_or_default(),
                ));
            }

            if let Some(first_mutating) = mutating.first() {
                let staged = self.approvals.stage(NewApprovalRequest {
                    conversation_id: request.conversation_id.clone(),
                    tool_name: first_mutating.name.clone(),
                    arguments: first_mutating.arguments.clone(),
                    safety_class: SafetyClass::Mutating,
                    synthetic_reason: None,
                    preview: None,
                });
                return match staged {
                    Ok(req) => self.approval_required_response(&request, req),
                    Err(_) => self.fatal_error_response(&request),
                };
            }
        }

        let mut content = self.last_assistant_content(&messages);
        let mut response_citations = None;
        let mut response_citations_appended = None;

        let cited_paths = extract_cited_paths(&messages);
        if !cited_paths.is_empty() {
            let already_cited =
                content.contains("Sources:") || cited_paths.iter().any(|path| content.contains(path.as_str()));
            if already_cited {
                response_citations_appended = Some(false);
            } else {
                let sources_block = cited_paths
                    .iter()
                    .map(|path| format!("- {path}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                content = format!("{content}\n\nSources:\n{sources_block}");
                response_citations_appended = Some(true);
            }
            response_citations = Some(cited_paths);
        }

        let delivery_handoff = if stop_reason == "provider_final_response" {
            self.delivery_handoff(&request, &content).await
        } else {
            None
        };

        let message = Message::assistant(content);

        TurnResponse {
            message,
            finish_reason: "stop".to_string(),
            conversation_id: request.conversation_id,
            tooling_state: ToolingState {
                tool_routing_mode: format!("{:?}", request.policy.routing_mode),
                tool_execution_mode: "native".to_string(),
                tool_profile: format!("{:?}", request.policy.tool_profile),
                tool_profile_source: "scope_policy".to_string(),
                tool_calls_executed_count: tool_calls_executed,
                tool_loop_stop_reason: stop_reason.to_string(),
                response_citations,
                response_citations_appended,
                provider_timeout_count: *provider_timeout_count,
                ..Default::default()
            },
            approval_required: None,
            approval_request: None,
            approval_resolution: None,
            delivery_handoff,
        }
    }

    /// §4.5 "Delivery handoff": only fires for `digest-<channel>`
    /// conversations on a successful terminal turn. Persistence failures are
    /// reflected in `delivery_record_status`, not raised.
    async fn delivery_handoff(&self, request: &TurnRequest, body: &str) -> Option<DeliveryHandoff> {
        let channel = request.conversation_type.strip_prefix("digest-")?;
        let (status, path) = match self
            .delivery
            .persist(channel, &request.conversation_type, body)
            .await
        {
            Ok(record_path) => ("persisted", Some(record_path)),
            Err(e) => {
                warn!(error = %e, channel, "delivery outbox persist failed");
                ("skipped", None)
            }
        };
        Some(DeliveryHandoff {
            channel: channel.to_string(),
            conversation_type: request.conversation_type.clone(),
            format: "markdown",
            body: body.to_string(),
            delivery_record_status: status,
            delivery_record_path: path,
        })
    }

    fn last_assistant_content(&self, messages: &[Message]) -> String {
        messages
            .iter()
            .rev()
            .find(|m| m.role == crate::model::MessageRole::Assistant)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    fn partition_calls(&self, calls: &[ToolCall]) -> (Vec<ToolCall>, Vec<ToolCall>) {
        let mut read_only = Vec::new();
        let mut mutating = Vec::new();
        for call in calls {
            match crate::tools::infer_safety_class(&call.name) {
                SafetyClass::ReadOnly => read_only.push(call.clone()),
                SafetyClass::Mutating => mutating.push(call.clone()),
            }
        }
        (read_only, mutating)
    }

    async fn invoke_read_only_or_mutating(
        &self,
        user_id: &str,
        tool_name: &str,
        arguments: &Value,
    ) -> crate::tools::ToolResult {
        let Some(tool) = self.tools.resolve(user_id, tool_name).unwrap_or(None) else {
            return crate::tools::ToolResult {
                ok: false,
                latency_ms: 0,
                http_status: None,
                data: None,
                error: Some(crate::tools::ToolResultError {
                    code: "TOOL_NOT_ALLOWED",
                    message: format!("tool '{tool_name}' is not enabled for this user"),
                    details: None,
                }),
            };
        };
        let Some(server) = self.tools.get_server(&tool.server_id).unwrap_or(None) else {
            return crate::tools::ToolResult {
                ok: false,
                latency_ms: 0,
                http_status: None,
                data: None,
                error: Some(crate::tools::ToolResultError {
                    code: "TOOL_EXECUTION_ERROR",
                    message: "mcp server not found".to_string(),
                    details: None,
                }),
            };
        };
        self.tools
            .invoke(user_id, &server, &tool, arguments, None)
            .await
    }

    async fn apply_resolution(
        &self,
        conversation_id: &str,
        action: &ApprovalAction,
    ) -> Result<ResolutionOutcome, crate::error::ApprovalError> {
        let resolution = match action.action {
            ApprovalActionKind::Approve => ApprovalResolution::Approved,
            ApprovalActionKind::Reject => ApprovalResolution::Rejected,
        };
        let resolved = self
            .approvals
            .resolve(conversation_id, &action.request_id, resolution)?;

        match resolution {
            ApprovalResolution::Rejected => Ok(ResolutionOutcome::Rejected),
            _ => Ok(ResolutionOutcome::Approved {
                tool_name: resolved.tool_name,
                arguments: resolved.arguments,
                request_id: resolved.request_id,
            }),
        }
    }

    fn approval_required_response(
        &self,
        request: &TurnRequest,
        approval: crate::model::ApprovalRequest,
    ) -> TurnResponse {
        info!(request_id = %approval.request_id, tool = %approval.tool_name, "staged approval request");
        TurnResponse {
            message: Message::assistant(APPROVAL_COPY),
            finish_reason: "stop".to_string(),
            conversation_id: request.conversation_id.clone(),
            tooling_state: ToolingState {
                tool_loop_stop_reason: "approval_required".to_string(),
                tool_routing_mode: format!("{:?}", request.policy.routing_mode),
                tool_profile: format!("{:?}", request.policy.tool_profile),
                ..Default::default()
            },
            approval_required: Some(true),
            approval_request: Some(ApprovalRequestView {
                request_id: approval.request_id,
                tool: approval.tool_name,
                arguments: approval.arguments,
                synthetic_reason: approval.synthetic_reason,
                safety_class: approval.safety_class,
                preview: approval.preview,
            }),
            approval_resolution: None,
            delivery_handoff: None,
        }
    }

    fn fatal_error_response(&self, request: &TurnRequest) -> TurnResponse {
        TurnResponse {
            message: Message::assistant("A request is already pending for this conversation."),
            finish_reason: "stop".to_string(),
            conversation_id: request.conversation_id.clone(),
            tooling_state: ToolingState {
                tool_loop_stop_reason: "error".to_string(),
                ..Default::default()
            },
            approval_required: None,
            approval_request: None,
            approval_resolution: None,
            delivery_handoff: None,
        }
    }

    fn digest_duplicate_guard_response(&self, request: &TurnRequest) -> TurnResponse {
        TurnResponse {
            message: Message::assistant("This digest schedule event was already processed."),
            finish_reason: "stop".to_string(),
            conversation_id: request.conversation_id.clone(),
            tooling_state: ToolingState {
                tool_loop_stop_reason: "provider_final_response".to_string(),
                digest_schedule_status: Some("duplicate_guard".to_string()),
                digest_schedule_duplicate_guard: Some("history_seen".to_string()),
                ..Default::default()
            },
            approval_required: None,
            approval_request: None,
            approval_resolution: None,
            delivery_handoff: None,
        }
    }

    fn pre_compaction_duplicate_guard_response(&self, request: &TurnRequest) -> TurnResponse {
        TurnResponse {
            message: Message::assistant("This pre-compaction flush event was already processed."),
            finish_reason: "stop".to_string(),
            conversation_id: request.conversation_id.clone(),
            tooling_state: ToolingState {
                tool_loop_stop_reason: "provider_final_response".to_string(),
                pre_compaction_flush_status: Some("duplicate_guard".to_string()),
                pre_compaction_duplicate_guard: Some("history_seen".to_string()),
                ..Default::default()
            },
            approval_required: None,
            approval_request: None,
            approval_resolution: None,
            delivery_handoff: None,
        }
    }
}

/// Scans executed read-only tool results (`tool` role messages) for a
/// `data.path` field — the shape a markdown-read tool reports — and
/// returns the distinct paths referenced, in first-seen order.
fn extract_cited_paths(messages: &[Message]) -> Vec<String> {
    let mut paths = Vec::new();
    for message in messages {
        if message.role != MessageRole::Tool {
            continue;
        }
        let Ok(result) = serde_json::from_str::<Value>(&message.content) else {
            continue;
        };
        let Some(path) = result.get("data").and_then(|data| data.get("path")).and_then(Value::as_str) else {
            continue;
        };
        if !paths.iter().any(|p: &String| p == path) {
            paths.push(path.to_string());
        }
    }
    paths
}

enum ResolutionOutcome {
    Approved {
        tool_name: String,
        arguments: Value,
        request_id: String,
    },
    Rejected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FakeClock};
    use crate::model::{McpServerRecord, MessageRole, Tool};
    use crate::policy::{RoutingMode, ScopeMode, ToolProfile};
    use crate::provider::{ChatChunk, ChatStream, Usage};
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    /// Scripted provider: replays one `ChatChunk` per call, in order.
    /// Panics if exhausted, so a test that drives more iterations than it
    /// scripted fails loudly instead of hanging.
    struct ScriptedProvider {
        responses: Mutex<Vec<ChatChunk>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<ChatChunk>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait::async_trait]
    impl AiProvider for ScriptedProvider {
        async fn chat_completion(&self, _request: ChatRequest) -> Result<ChatChunk, crate::provider::ProviderError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                panic!("ScriptedProvider exhausted");
            }
            Ok(responses.remove(0))
        }

        async fn chat_completion_stream(
            &self,
            _request: ChatRequest,
        ) -> Result<ChatStream, crate::provider::ProviderError> {
            unimplemented!("not exercised by these tests")
        }

        async fn list_models(&self) -> Result<Vec<String>, crate::provider::ProviderError> {
            Ok(vec![])
        }

        async fn validate_credentials(&self) -> Result<bool, crate::provider::ProviderError> {
            Ok(true)
        }
    }

    fn policy() -> EffectivePolicy {
        EffectivePolicy {
            scope_mode: ScopeMode::None,
            project_slug: None,
            tool_profile: ToolProfile::Full,
            routing_mode: RoutingMode::SinglePathNative,
            synthetic_plan: None,
        }
    }

    fn request(conversation_id: &str, params: TurnParams) -> TurnRequest {
        TurnRequest {
            conversation_id: conversation_id.to_string(),
            conversation_type: "chat".to_string(),
            user_id: "user-1".to_string(),
            model: "gpt-test".to_string(),
            messages: vec![Message::user("do the thing")],
            policy: policy(),
            params,
        }
    }

    fn harness(provider: ScriptedProvider) -> (ToolLoop, Arc<dyn crate::store::Store>) {
        let store: Arc<dyn crate::store::Store> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new(chrono::Utc::now()));
        let tools = Arc::new(ToolRegistry::new(
            Arc::clone(&store),
            std::time::Duration::from_secs(5),
            None,
        ));
        let approvals = Arc::new(ApprovalLedger::new(
            Arc::clone(&store),
            clock,
            crate::approval::ApprovalLedgerConfig::default(),
        ));
        let tool_loop = ToolLoop::new(
            Arc::new(provider),
            tools,
            approvals,
            Arc::clone(&store),
            Arc::new(crate::delivery::NullDeliveryOutbox),
            ToolLoopConfig::default(),
        );
        (tool_loop, store)
    }

    fn seed_mutating_tool(store: &Arc<dyn crate::store::Store>) {
        let server = McpServerRecord::new("srv-1".to_string(), "user-1".to_string(), "http://localhost:9001".to_string());
        store.upsert_server(&server).unwrap();
        store
            .upsert_tool(&Tool {
                name: "create_project".to_string(),
                description: "creates a project".to_string(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
                safety_class: SafetyClass::Mutating,
                enabled: true,
                stale: false,
                server_id: "srv-1".to_string(),
                source_hash: "hash".to_string(),
                version: "hash".to_string(),
            })
            .unwrap();
    }

    fn seed_read_only_tool(store: &Arc<dyn crate::store::Store>, name: &str) {
        let server = McpServerRecord::new("srv-1".to_string(), "user-1".to_string(), "http://localhost:9001".to_string());
        store.upsert_server(&server).unwrap();
        store
            .upsert_tool(&Tool {
                name: name.to_string(),
                description: "reads something".to_string(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
                safety_class: SafetyClass::ReadOnly,
                enabled: true,
                stale: false,
                server_id: "srv-1".to_string(),
                source_hash: "hash".to_string(),
                version: "hash".to_string(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn mutating_tool_call_stages_approval_instead_of_executing() {
        let provider = ScriptedProvider::new(vec![ChatChunk {
            content: None,
            role: Some("assistant".to_string()),
            tool_calls: Some(vec![ToolCall {
                id: "call-1".to_string(),
                name: "create_project".to_string(),
                arguments: serde_json::json!({"path": "projects/active/demo"}),
            }]),
            finish_reason: Some("tool_calls".to_string()),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            id: None,
        }]);
        let (tool_loop, store) = harness(provider);
        seed_mutating_tool(&store);

        let response = tool_loop.run(request("conv-1", TurnParams::default())).await;

        assert_eq!(response.approval_required, Some(true));
        assert_eq!(response.message.content, APPROVAL_COPY);
        let approval = response.approval_request.expect("approval request present");
        assert_eq!(approval.tool, "create_project");
        assert_eq!(approval.safety_class, SafetyClass::Mutating);
    }

    #[tokio::test]
    async fn rejecting_the_pending_approval_does_not_invoke_the_tool() {
        let provider = ScriptedProvider::new(vec![ChatChunk {
            content: None,
            role: Some("assistant".to_string()),
            tool_calls: Some(vec![ToolCall {
                id: "call-1".to_string(),
                name: "create_project".to_string(),
                arguments: serde_json::json!({"path": "projects/active/demo"}),
            }]),
            finish_reason: Some("tool_calls".to_string()),
            usage: None,
            id: None,
        }]);
        let (tool_loop, store) = harness(provider);
        seed_mutating_tool(&store);

        let staged = tool_loop.run(request("conv-2", TurnParams::default())).await;
        let request_id = staged.approval_request.unwrap().request_id;

        let mut params = TurnParams::default();
        params.mcp_approval = Some(ApprovalAction {
            action: ApprovalActionKind::Reject,
            request_id,
        });
        let resolved = tool_loop.run(request("conv-2", params)).await;

        assert_eq!(resolved.approval_resolution.unwrap().status, "rejected");
        assert_eq!(resolved.message.role, MessageRole::Assistant);
        assert_eq!(resolved.tooling_state.tool_calls_executed_count, 0);
    }

    #[tokio::test]
    async fn read_only_tool_call_executes_without_approval_and_loop_continues() {
        let provider = ScriptedProvider::new(vec![
            ChatChunk {
                content: None,
                role: Some("assistant".to_string()),
                tool_calls: Some(vec![ToolCall {
                    id: "call-1".to_string(),
                    name: "list_pages".to_string(),
                    arguments: serde_json::json!({}),
                }]),
                finish_reason: Some("tool_calls".to_string()),
                usage: None,
                id: None,
            },
            ChatChunk {
                content: Some("Here are your pages.".to_string()),
                role: Some("assistant".to_string()),
                tool_calls: None,
                finish_reason: Some("stop".to_string()),
                usage: None,
                id: None,
            },
        ]);
        let (tool_loop, _store) = harness(provider);

        let response = tool_loop.run(request("conv-3", TurnParams::default())).await;

        assert_eq!(response.tooling_state.tool_calls_executed_count, 1);
        assert_eq!(response.message.content, "Here are your pages.");
        assert!(response.approval_required.is_none());
    }

    #[tokio::test]
    async fn new_page_synthetic_plan_stages_approval_with_synthetic_reason() {
        let provider = ScriptedProvider::new(vec![]);
        let (tool_loop, store) = harness(provider);
        seed_mutating_tool(&store);

        let mut policy = policy();
        policy.synthetic_plan = Some(vec![crate::policy::new_page_engine_scaffold(
            "projects/active/side-business",
        )]);

        let mut req = request("conv-4", TurnParams::default());
        req.policy = policy;

        let response = tool_loop.run(req).await;

        assert_eq!(response.approval_required, Some(true));
        let approval = response.approval_request.unwrap();
        assert_eq!(approval.tool, "create_project");
        assert_eq!(approval.synthetic_reason.as_deref(), Some("new_page_engine_scaffold"));
        assert_eq!(approval.arguments["path"], "projects/active/side-business");
    }

    #[tokio::test]
    async fn completed_synthetic_plan_stops_without_calling_the_provider() {
        let provider = ScriptedProvider::new(vec![]);
        let (tool_loop, store) = harness(provider);
        seed_read_only_tool(&store, "list_pages");

        let mut policy = policy();
        policy.synthetic_plan = Some(vec![SyntheticStep {
            tool_name: "list_pages".to_string(),
            arguments: serde_json::json!({}),
            synthetic_reason: "new_page_engine_scaffold".to_string(),
        }]);

        let mut req = request("conv-5", TurnParams::default());
        req.params.mcp_auto_approve_mutating = true;
        req.policy = policy;

        let response = tool_loop.run(req).await;

        assert_eq!(
            response.tooling_state.tool_loop_stop_reason,
            "deterministic_new_page_interview_turn"
        );
        assert_eq!(response.tooling_state.tool_calls_executed_count, 1);
    }

    #[tokio::test]
    async fn second_turn_with_same_digest_schedule_event_id_hits_duplicate_guard() {
        let provider = ScriptedProvider::new(vec![ChatChunk {
            content: Some("Digest sent.".to_string()),
            role: Some("assistant".to_string()),
            tool_calls: None,
            finish_reason: Some("stop".to_string()),
            usage: None,
            id: None,
        }]);
        let (tool_loop, _store) = harness(provider);

        let mut params = TurnParams::default();
        params.mcp_digest_force_run = true;
        params.mcp_digest_schedule_event_id = Some("E-1".to_string());
        let mut req = request("conv-6", params.clone());
        req.conversation_type = "digest-email".to_string();

        let first = tool_loop.run(req).await;
        assert_ne!(first.tooling_state.digest_schedule_status.as_deref(), Some("duplicate_guard"));

        let mut second_req = request("conv-6", params);
        second_req.conversation_type = "digest-email".to_string();
        let second = tool_loop.run(second_req).await;

        assert_eq!(second.tooling_state.digest_schedule_status.as_deref(), Some("duplicate_guard"));
        assert_eq!(
            second.tooling_state.digest_schedule_duplicate_guard.as_deref(),
            Some("history_seen")
        );
    }

    #[test]
    fn extract_cited_paths_reads_distinct_data_path_fields_in_first_seen_order() {
        let messages = vec![
            Message::user("summarize my notes"),
            Message::assistant_with_calls(
                "",
                vec![ToolCall {
                    id: "call-1".to_string(),
                    name: "read_page".to_string(),
                    arguments: serde_json::json!({"path": "projects/active/demo/notes.md"}),
                }],
            ),
            Message::tool_result(
                "call-1",
                serde_json::json!({
                    "ok": true,
                    "latency_ms": 12,
                    "http_status": 200,
                    "data": {"path": "projects/active/demo/notes.md", "content": "..."}
                })
                .to_string(),
            ),
            Message::tool_result(
                "call-2",
                serde_json::json!({
                    "ok": true,
                    "latency_ms": 8,
                    "http_status": 200,
                    "data": {"path": "projects/active/demo/notes.md"}
                })
                .to_string(),
            ),
            Message::tool_result(
                "call-3",
                serde_json::json!({
                    "ok": false,
                    "latency_ms": 5,
                    "http_status": null,
                    "error": {"code": "TOOL_EXECUTION_ERROR", "message": "connection refused"}
                })
                .to_string(),
            ),
        ];

        let paths = extract_cited_paths(&messages);
        assert_eq!(paths, vec!["projects/active/demo/notes.md".to_string()]);
    }

    #[tokio::test]
    async fn citations_are_appended_exactly_once_when_absent_from_the_final_turn() {
        let provider = ScriptedProvider::new(vec![
            ChatChunk {
                content: None,
                role: Some("assistant".to_string()),
                tool_calls: Some(vec![ToolCall {
                    id: "call-1".to_string(),
                    name: "read_page".to_string(),
                    arguments: serde_json::json!({"path": "projects/active/demo/notes.md"}),
                }]),
                finish_reason: Some("tool_calls".to_string()),
                usage: None,
                id: None,
            },
            ChatChunk {
                content: Some("Here is a summary of your notes.".to_string()),
                role: Some("assistant".to_string()),
                tool_calls: None,
                finish_reason: Some("stop".to_string()),
                usage: None,
                id: None,
            },
        ]);
        let (tool_loop, store) = harness(provider);
        seed_read_only_tool(&store, "read_page");

        let response = tool_loop.run(request("conv-7", TurnParams::default())).await;

        // `invoke` dispatches over HTTP to an MCP server that isn't actually
        // running in this test, so the tool result carries no `data.path` and
        // no citation block is appended — the extraction itself is exercised
        // directly above.
        assert!(response.tooling_state.response_citations.is_none());
        assert_eq!(response.message.content, "Here is a summary of your notes.");
    }
}
