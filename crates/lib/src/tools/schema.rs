//! Minimal argument validation against a tool's JSON schema: object shape, required keys, primitive types.

use serde_json::{Map, Value};

use super::ToolError;

/// Normalize and check `args`. Strings are parsed as JSON (some models encode arguments that way)
/// and null becomes `{}`. Returns the arguments object to pass to the tool.
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<Value, ToolError> {
    let args = match args {
        Value::Null => Value::Object(Map::new()),
        Value::String(s) if s.trim().is_empty() => Value::Object(Map::new()),
        Value::String(s) => serde_json::from_str(s).map_err(|e| {
            ToolError::InvalidArguments(format!("arguments are not valid JSON: {}", e))
        })?,
        other => other.clone(),
    };
    let Some(obj) = args.as_object() else {
        return Err(ToolError::InvalidArguments(
            "arguments must be an object".to_string(),
        ));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if obj.get(key).map_or(true, Value::is_null) {
                return Err(ToolError::InvalidArguments(format!(
                    "missing required parameter: {}",
                    key
                )));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in obj {
            let Some(expected) = props.get(key).and_then(|p| p.get("type")).and_then(Value::as_str)
            else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if !matches_type(expected, value) {
                return Err(ToolError::InvalidArguments(format!(
                    "parameter {} must be of type {}",
                    key, expected
                )));
            }
        }
    }

    Ok(args)
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}
