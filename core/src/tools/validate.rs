use jsonschema::JSONSchema;
use serde_json::Value;

/// Validates `arguments` against a tool's JSON Schema (Draft 7). Prefers a
/// real schema validator; only when the schema cannot be compiled does this
/// fall back to a required-keys check — a last resort, not the default path.
pub fn validate_arguments(parameters: &Value, arguments: &Value) -> Result<(), Vec<String>> {
    if !arguments.is_object() {
        return Err(vec!["Tool arguments must be a JSON object.".to_string()]);
    }

    if !parameters.is_object() {
        return Ok(());
    }

    match JSONSchema::options()
        .with_draft(jsonschema::Draft::Draft7)
        .compile(parameters)
    {
        Ok(schema) => {
            let result = schema.validate(arguments);
            match result {
                Ok(()) => Ok(()),
                Err(errors) => Err(errors.map(|e| e.to_string()).collect()),
            }
        }
        Err(_) => required_fields_fallback(parameters, arguments),
    }
}

fn required_fields_fallback(parameters: &Value, arguments: &Value) -> Result<(), Vec<String>> {
    let required = parameters
        .get("required")
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default();

    let missing: Vec<String> = required
        .iter()
        .filter_map(|key| key.as_str())
        .filter(|key| arguments.get(key).is_none())
        .map(|key| format!("Missing required argument: {key}"))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_when_required_fields_present() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        });
        let args = serde_json::json!({"path": "projects/active/foo"});
        assert!(validate_arguments(&schema, &args).is_ok());
    }

    #[test]
    fn fails_when_required_field_missing() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        });
        let args = serde_json::json!({});
        let errors = validate_arguments(&schema, &args).unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn fails_when_arguments_are_not_an_object() {
        let schema = serde_json::json!({"type": "object"});
        let args = serde_json::json!("not an object");
        assert!(validate_arguments(&schema, &args).is_err());
    }

    #[test]
    fn empty_schema_accepts_anything() {
        let args = serde_json::json!({"anything": true});
        assert!(validate_arguments(&Value::Null, &args).is_ok());
    }
}
