// Rex Core - Result summary and oversized-output truncation
//
// A completed recipe's context can be enormous. Callers get a compact
// summary: the reserved metadata, one explicit final output, and the list
// of available output keys; the full context stays on disk under the
// session id.

use serde_json::{json, Value};

use crate::context::{Context, RESERVED_CONTEXT_KEYS, SKIPPED_STEPS_KEY};
use crate::recipe::Recipe;

/// Cap on string/structure bytes returned in an outward payload.
/// Roughly 2.5k tokens, leaving room for the rest of the result.
pub const MAX_OUTPUT_SIZE_BYTES: usize = 10_000;

/// Truncate a value that would blow up the outward payload.
///
/// Strings are cut with a trailing marker; maps and lists are replaced by
/// an envelope describing the full size with a short preview.
pub fn truncate_value(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            if s.len() > MAX_OUTPUT_SIZE_BYTES {
                let cut = floor_char_boundary(s, MAX_OUTPUT_SIZE_BYTES);
                Value::String(format!(
                    "{}\n\n[... truncated, see session for full output]",
                    &s[..cut]
                ))
            } else {
                value.clone()
            }
        }
        Value::Object(_) | Value::Array(_) => {
            let serialized = value.to_string();
            if serialized.len() > MAX_OUTPUT_SIZE_BYTES {
                let cut = floor_char_boundary(&serialized, 500);
                let preview = if serialized.len() > 500 {
                    format!("{}...", &serialized[..cut])
                } else {
                    serialized.clone()
                };
                json!({
                    "_truncated": true,
                    "_type": if value.is_object() { "map" } else { "list" },
                    "_full_size_bytes": serialized.len(),
                    "_preview": preview,
                    "_message": "See session files for full output",
                })
            } else {
                value.clone()
            }
        }
        other => other.clone(),
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Extract a compact summary from a final execution context.
///
/// Output priority: an explicit `final_output` context key, else the last
/// step's declared output variable. Non-underscore keys are listed for
/// discovery.
pub fn extract_result_summary(context: &Context, recipe: Option<&Recipe>) -> Value {
    let mut summary = serde_json::Map::new();

    if let Some(session) = context.get("session") {
        summary.insert("session".into(), session.clone());
    }
    if let Some(recipe_meta) = context.get("recipe") {
        summary.insert("recipe_metadata".into(), recipe_meta.clone());
    }
    if let Some(stage) = context.get("stage") {
        summary.insert("last_stage".into(), stage.clone());
    }
    if let Some(step) = context.get("step") {
        summary.insert("last_step".into(), step.clone());
    }
    if let Some(skipped) = context.get(SKIPPED_STEPS_KEY) {
        summary.insert("skipped_steps".into(), skipped.clone());
    }

    if let Some(final_output) = context.get("final_output") {
        summary.insert("final_output".into(), truncate_value(final_output));
    } else if let Some(key) = recipe.and_then(Recipe::last_output_key) {
        if let Some(value) = context.get(key) {
            summary.insert("final_output".into(), truncate_value(value));
            summary.insert("final_output_key".into(), Value::String(key.to_string()));
        }
    }

    let output_keys: Vec<Value> = context
        .keys()
        .filter(|k| !k.starts_with('_') && !RESERVED_CONTEXT_KEYS.contains(&k.as_str()))
        .map(|k| Value::String(k.clone()))
        .collect();
    summary.insert("available_outputs".into(), Value::Array(output_keys));

    if let Some(session) = context.get("session") {
        let session_id = session
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        summary.insert(
            "full_results_location".into(),
            Value::String(format!(
                "Full results saved in recipe session: {session_id}. \
                 Use the list operation to see session details."
            )),
        );
    }

    Value::Object(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Recipe;
    use serde_json::json;

    fn ctx(value: Value) -> Context {
        Context::from_map(value.as_object().unwrap().clone())
    }

    #[test]
    fn small_values_pass_through() {
        assert_eq!(truncate_value(&json!("short")), json!("short"));
        assert_eq!(truncate_value(&json!({"a": 1})), json!({"a": 1}));
        assert_eq!(truncate_value(&json!(42)), json!(42));
    }

    #[test]
    fn long_strings_get_marker() {
        let long = "x".repeat(MAX_OUTPUT_SIZE_BYTES + 1000);
        let out = truncate_value(&Value::String(long));
        let text = out.as_str().unwrap();
        assert!(text.len() < MAX_OUTPUT_SIZE_BYTES + 100);
        assert!(text.ends_with("[... truncated, see session for full output]"));
    }

    #[test]
    fn big_structures_become_envelopes() {
        let big = json!({ "data": "y".repeat(MAX_OUTPUT_SIZE_BYTES * 2) });
        let out = truncate_value(&big);
        assert_eq!(out["_truncated"], json!(true));
        assert_eq!(out["_type"], json!("map"));
        assert!(out["_full_size_bytes"].as_u64().unwrap() > MAX_OUTPUT_SIZE_BYTES as u64);
        assert!(out["_preview"].as_str().unwrap().len() <= 504);
    }

    #[test]
    fn summary_prefers_explicit_final_output() {
        let c = ctx(json!({
            "session": {"id": "s-1"},
            "recipe": {"name": "r"},
            "final_output": "the answer",
            "other": 1,
        }));
        let summary = extract_result_summary(&c, None);
        assert_eq!(summary["final_output"], json!("the answer"));
        assert_eq!(summary["session"], json!({"id": "s-1"}));
        let outputs = summary["available_outputs"].as_array().unwrap();
        assert!(outputs.contains(&json!("final_output")));
        assert!(outputs.contains(&json!("other")));
        assert!(!outputs.contains(&json!("session")));
    }

    #[test]
    fn summary_falls_back_to_last_step_output() {
        let recipe = Recipe::from_yaml_str(
            r#"
name: r
description: d
version: 1.0.0
steps:
  - id: a
    agent: x
    prompt: p
    output: answer
"#,
        )
        .unwrap();
        let c = ctx(json!({"answer": "42", "_skipped_steps": ["b"]}));
        let summary = extract_result_summary(&c, Some(&recipe));
        assert_eq!(summary["final_output"], json!("42"));
        assert_eq!(summary["final_output_key"], json!("answer"));
        assert_eq!(summary["skipped_steps"], json!(["b"]));
    }
}
