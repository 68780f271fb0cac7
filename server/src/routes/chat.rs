//! `POST /v1/chat` — the canonical chat-invocation contract (§6), thinly
//! wrapping `ToolLoop::run`. The only work this handler does beyond
//! translation is resolving `conversation_type` + caller params into an
//! `EffectivePolicy` and picking a concrete `AiProvider`.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use braindrive_core::clock::new_id;
use braindrive_core::model::Message;
use braindrive_core::orchestrator::{
    ApprovalAction, ApprovalRequestView, ApprovalResolutionView, DeliveryHandoff, ToolingState, TurnParams,
    TurnRequest,
};
use braindrive_core::policy::{self, UserParams};
use braindrive_core::provider::ChatParams;

use crate::error::AppError;
use crate::routes::user_id_header;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/chat", post(chat))
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ChatParamsBody {
    pub mcp_auto_approve_mutating: bool,
    pub mcp_project_slug: Option<String>,
    pub mcp_approval: Option<ApprovalAction>,
    pub mcp_digest_force_run: bool,
    pub mcp_digest_schedule_event_id: Option<String>,
    pub mcp_pre_compaction_event_id: Option<String>,
    pub new_page_engine_scaffold_path: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct ChatInvocationRequest {
    pub provider: String,
    #[serde(default)]
    pub settings_id: Option<String>,
    pub model: String,
    pub messages: Vec<Message>,
    pub conversation_type: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub params: ChatParamsBody,
}

#[derive(Debug, Serialize)]
pub struct ChoiceDto {
    pub message: Message,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct ChatInvocationResponse {
    pub choices: Vec<ChoiceDto>,
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

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatInvocationRequest>,
) -> Result<Json<ChatInvocationResponse>, AppError> {
    let user_id = user_id_header(&headers)?;
    let provider = state
        .providers
        .resolve(&body.provider, body.settings_id.as_deref())
        .ok_or_else(|| AppError::BadRequest(format!("no provider configured for '{}'", body.provider)))?;

    let conversation_id = body.conversation_id.unwrap_or_else(new_id);

    let user_params = UserParams {
        mcp_project_slug: body.params.mcp_project_slug.clone(),
        new_page_engine_scaffold_path: body.params.new_page_engine_scaffold_path.clone(),
        ..Default::default()
    };
    let policy = policy::resolve(&body.conversation_type, &user_params);

    let turn = TurnRequest {
        conversation_id,
        conversation_type: body.conversation_type,
        user_id,
        model: body.model,
        messages: body.messages,
        policy,
        params: TurnParams {
            chat: ChatParams {
                temperature: body.params.temperature,
                max_tokens: body.params.max_tokens,
                top_p: body.params.top_p,
            },
            mcp_auto_approve_mutating: body.params.mcp_auto_approve_mutating,
            mcp_approval: body.params.mcp_approval,
            mcp_digest_force_run: body.params.mcp_digest_force_run,
            mcp_digest_schedule_event_id: body.params.mcp_digest_schedule_event_id,
            mcp_pre_compaction_event_id: body.params.mcp_pre_compaction_event_id,
        },
    };

    let response = state.context.tool_loop(provider).run(turn).await;

    Ok(Json(ChatInvocationResponse {
        choices: vec![ChoiceDto {
            message: response.message,
            finish_reason: response.finish_reason,
        }],
        conversation_id: response.conversation_id,
        tooling_state: response.tooling_state,
        approval_required: response.approval_required,
        approval_request: response.approval_request,
        approval_resolution: response.approval_resolution,
        delivery_handoff: response.delivery_handoff,
    }))
}
