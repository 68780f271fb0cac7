use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 over the canonical JSON encoding (sorted keys, no whitespace) of
/// the normalized tool envelope. Relies on `serde_json::Map` being backed by
/// a `BTreeMap` (the `preserve_order` feature is never enabled in this
/// workspace), so `Value::to_string()` already emits sorted-key JSON.
pub fn compute_tool_hash(normalized_envelope: &Value) -> String {
    let canonical = normalized_envelope.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_across_key_order() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(compute_tool_hash(&a), compute_tool_hash(&b));
    }

    #[test]
    fn hash_changes_with_content() {
        let a = serde_json::json!({"a": 1});
        let b = serde_json::json!({"a": 2});
        assert_ne!(compute_tool_hash(&a), compute_tool_hash(&b));
    }
}
