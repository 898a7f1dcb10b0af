//! Structured-output envelope checks.
//!
//! A zero exit code is not enough for a story to count as done: the agent's
//! final output must be an object with a string `summary` and a `status`
//! from the closed set. The informational lists are not load-bearing.

use serde_json::Value;

use crate::core::types::{AgentOutput, AgentStatus};

/// Validate the final output of an engine call.
///
/// Returns the parsed envelope, or stable error messages describing every
/// violation found.
pub fn validate_output(output: Option<&Value>) -> Result<AgentOutput, Vec<String>> {
    let Some(value) = output else {
        return Err(vec!["missing final output".to_string()]);
    };
    let Some(object) = value.as_object() else {
        return Err(vec![format!(
            "final output must be a JSON object (got {})",
            kind_of(value)
        )]);
    };

    let mut errors = Vec::new();

    let summary = match object.get("summary") {
        Some(Value::String(summary)) => Some(summary.clone()),
        Some(other) => {
            errors.push(format!("summary must be a string (got {})", kind_of(other)));
            None
        }
        None => {
            errors.push("missing summary".to_string());
            None
        }
    };

    let status = match object.get("status") {
        Some(Value::String(raw)) => {
            let parsed = AgentStatus::parse(raw);
            if parsed.is_none() {
                errors.push(format!(
                    "status must be one of ok|needs_human|failed (got '{raw}')"
                ));
            }
            parsed
        }
        Some(other) => {
            errors.push(format!("status must be a string (got {})", kind_of(other)));
            None
        }
        None => {
            errors.push("missing status".to_string());
            None
        }
    };

    match (status, summary) {
        (Some(status), Some(summary)) if errors.is_empty() => Ok(AgentOutput {
            status,
            summary,
            files_changed: string_list(object.get("files_changed")),
            tests_run: string_list(object.get("tests_run")),
            notes: string_list(object.get("notes")),
        }),
        _ => Err(errors),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
