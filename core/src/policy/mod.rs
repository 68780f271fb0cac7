//! Pure routing/scope decisions given conversation type + caller params
//! (§4.1). No IO, no state — a function of its inputs, tested as such.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMode {
    None,
    Project,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolProfile {
    ReadOnly,
    Digest,
    Full,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    SinglePathNative,
    DualPathFallback,
    DualPathProjectScopeCompat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticStep {
    pub tool_name: String,
    pub arguments: Value,
    pub synthetic_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub scope_mode: ScopeMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
    pub tool_profile: ToolProfile,
    pub routing_mode: RoutingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic_plan: Option<Vec<SyntheticStep>>,
}

#[derive(Debug, Clone, Default)]
pub struct UserParams {
    pub mcp_native_tool_calling: Option<bool>,
    pub mcp_project_slug: Option<String>,
    pub new_page_engine_scaffold_path: Option<String>,
}

/// Given `(conversation_type, user_params)`, resolves the effective policy.
/// Prefix rules, evaluated in this order: `digest-<channel>`, `life-<topic>`,
/// `project-<name>`, then the bare `chat` / unknown-type fallback (§4.1).
pub fn resolve(conversation_type: &str, params: &UserParams) -> EffectivePolicy {
    let mut policy = if conversation_type.starts_with("digest-") {
        EffectivePolicy {
            scope_mode: ScopeMode::Project,
            project_slug: Some("digest".to_string()),
            tool_profile: ToolProfile::Digest,
            routing_mode: RoutingMode::SinglePathNative,
            synthetic_plan: None,
        }
    } else if let Some(topic) = conversation_type.strip_prefix("life-") {
        EffectivePolicy {
            scope_mode: ScopeMode::Project,
            project_slug: Some(topic.to_string()),
            tool_profile: ToolProfile::Full,
            routing_mode: RoutingMode::SinglePathNative,
            synthetic_plan: None,
        }
    } else if let Some(project_name) = conversation_type.strip_prefix("project-") {
        let slug = params
            .mcp_project_slug
            .clone()
            .unwrap_or_else(|| project_name.to_string());
        EffectivePolicy {
            scope_mode: ScopeMode::Project,
            project_slug: Some(slug),
            tool_profile: ToolProfile::Full,
            routing_mode: RoutingMode::DualPathProjectScopeCompat,
            synthetic_plan: None,
        }
    } else if conversation_type == "chat" && params.mcp_project_slug.is_some() {
        EffectivePolicy {
            scope_mode: ScopeMode::Project,
            project_slug: params.mcp_project_slug.clone(),
            tool_profile: ToolProfile::Full,
            routing_mode: RoutingMode::DualPathProjectScopeCompat,
            synthetic_plan: None,
        }
    } else {
        EffectivePolicy {
            scope_mode: ScopeMode::None,
            project_slug: None,
            tool_profile: ToolProfile::Full,
            routing_mode: RoutingMode::SinglePathNative,
            synthetic_plan: None,
        }
    };

    // A caller-supplied scaffold path always injects the deterministic
    // new-page interview plan on top of whatever scope/profile the
    // conversation type resolved to (§4.1, §4.5 "Synthetic injection").
    if let Some(path) = &params.new_page_engine_scaffold_path {
        policy.synthetic_plan = Some(vec![new_page_engine_scaffold(path)]);
    }

    policy
}

/// Deterministic scaffold injection for a brand-new project page, matching
/// the `new_page_engine_scaffold` synthetic reason from §4.1/§4.5.
pub fn new_page_engine_scaffold(path: &str) -> SyntheticStep {
    SyntheticStep {
        tool_name: "create_project".to_string(),
        arguments: serde_json::json!({ "path": path }),
        synthetic_reason: "new_page_engine_scaffold".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_prefix_sets_digest_profile_and_project_scope() {
        let policy = resolve("digest-email", &UserParams::default());
        assert_eq!(policy.scope_mode, ScopeMode::Project);
        assert_eq!(policy.project_slug.as_deref(), Some("digest"));
        assert_eq!(policy.tool_profile, ToolProfile::Digest);
    }

    #[test]
    fn life_prefix_forces_project_scope_from_conversation_type() {
        let policy = resolve("life-finances", &UserParams::default());
        assert_eq!(policy.scope_mode, ScopeMode::Project);
        assert_eq!(policy.project_slug.as_deref(), Some("finances"));
    }

    #[test]
    fn project_prefix_carries_ui_supplied_scope() {
        let mut params = UserParams::default();
        params.mcp_project_slug = Some("side-business".to_string());
        let policy = resolve("project-anything", &params);
        assert_eq!(policy.project_slug.as_deref(), Some("side-business"));
        assert_eq!(policy.routing_mode, RoutingMode::DualPathProjectScopeCompat);
    }

    #[test]
    fn project_scoped_chat_uses_dual_path_compat_with_full_profile() {
        let mut params = UserParams::default();
        params.mcp_project_slug = Some("side-business".to_string());
        let policy = resolve("chat", &params);
        assert_eq!(policy.routing_mode, RoutingMode::DualPathProjectScopeCompat);
        assert_eq!(policy.tool_profile, ToolProfile::Full);
    }

    #[test]
    fn unknown_type_defaults_to_single_path_native() {
        let policy = resolve("capture", &UserParams::default());
        assert_eq!(policy.routing_mode, RoutingMode::SinglePathNative);
        assert_eq!(policy.scope_mode, ScopeMode::None);
    }

    #[test]
    fn scaffold_path_injects_synthetic_plan_on_a_plain_chat_turn() {
        let mut params = UserParams::default();
        params.new_page_engine_scaffold_path = Some("projects/active/side-business".to_string());
        let policy = resolve("chat", &params);

        let plan = policy.synthetic_plan.expect("synthetic plan present");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].synthetic_reason, "new_page_engine_scaffold");
        assert_eq!(plan[0].tool_name, "create_project");
        assert_eq!(plan[0].arguments["path"], "projects/active/side-business");
    }

    #[test]
    fn scaffold_path_overlays_on_top_of_project_scoped_policies_too() {
        let mut params = UserParams::default();
        params.mcp_project_slug = Some("side-business".to_string());
        params.new_page_engine_scaffold_path = Some("projects/active/side-business".to_string());
        let policy = resolve("project-anything", &params);

        assert_eq!(policy.project_slug.as_deref(), Some("side-business"));
        assert!(policy.synthetic_plan.is_some());
    }
}
