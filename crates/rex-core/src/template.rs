// Rex Core - Template substitution
//
// Templates are `{{identifier(.identifier)*}}` references resolved against
// the context by dotted path. Scalars render as their string form; maps
// and lists render as canonical JSON so the output re-parses to the same
// value. Undefined paths fail with the missing key and the keys that do
// exist at that depth.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::context::Context;
use crate::error::{RexError, RexResult};

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(\w+(?:\.\w+)*)\}\}").unwrap())
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        // Canonical JSON for structures; to_string on scalars matches it
        other => other.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Resolve a dotted path against the context with precise failures
pub fn resolve_path<'a>(context: &'a Context, var_ref: &str) -> RexResult<&'a Value> {
    let mut current: Option<&Value> = None;
    let mut walked: Vec<&str> = Vec::new();

    for part in var_ref.split('.') {
        walked.push(part);
        let next = match current {
            None => context.get(part),
            Some(Value::Object(map)) => map.get(part),
            Some(other) => {
                let parent_path = walked[..walked.len() - 1].join(".");
                return Err(RexError::template(format!(
                    "Cannot access '{part}' on {{{{{parent_path}}}}} - it's a {}, not a map. \
                     Hint: The step producing '{parent_path}' may have failed to parse JSON. \
                     Check that the step outputs clean JSON or add 'parse_json: true'.",
                    json_type_name(other)
                )));
            }
        };

        match next {
            Some(value) => current = Some(value),
            None => {
                let mut siblings: Vec<String> = match current {
                    None => context.keys().cloned().collect(),
                    Some(Value::Object(map)) => map.keys().cloned().collect(),
                    Some(_) => unreachable!("non-map parent handled above"),
                };
                siblings.sort_unstable();
                let at = if walked.len() == 1 {
                    "Available variables".to_string()
                } else {
                    format!("Available keys at '{}'", walked[..walked.len() - 1].join("."))
                };
                return Err(RexError::template(format!(
                    "Undefined variable: {{{{{var_ref}}}}}. Key '{part}' not found. {at}: {}",
                    siblings.join(", ")
                )));
            }
        }
    }

    // Split always yields at least one part, so current is set here
    current.ok_or_else(|| RexError::template(format!("Undefined variable: {{{{{var_ref}}}}}")))
}

/// Replace every `{{variable}}` reference in `template` with its value
pub fn substitute(template: &str, context: &Context) -> RexResult<String> {
    let re = template_regex();
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in re.captures_iter(template) {
        let whole = caps.get(0).unwrap();
        let var_ref = caps.get(1).unwrap().as_str();
        out.push_str(&template[last..whole.start()]);
        out.push_str(&render_value(resolve_path(context, var_ref)?));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Recursively substitute `{{variable}}` references inside a JSON value.
///
/// Strings are substituted; maps and lists are walked; other scalars pass
/// through unchanged. Used for sub-recipe context maps.
pub fn substitute_value(value: &Value, context: &Context) -> RexResult<Value> {
    match value {
        Value::String(s) => Ok(Value::String(substitute(s, context)?)),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute_value(v, context)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| substitute_value(item, context))
            .collect::<RexResult<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Resolve an expression that must be exactly one `{{path}}` reference.
///
/// Used for `foreach`, where the collection is a value, not a string.
pub fn resolve_single_reference<'a>(expr: &str, context: &'a Context) -> RexResult<&'a Value> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^\{\{(\w+(?:\.\w+)*)\}\}$").unwrap());

    let caps = re
        .captures(expr.trim())
        .ok_or_else(|| RexError::template(format!("Invalid foreach syntax: {expr}")))?;
    resolve_path(context, caps.get(1).unwrap().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: serde_json::Value) -> Context {
        Context::from_map(value.as_object().unwrap().clone())
    }

    #[test]
    fn substitutes_scalars() {
        let c = ctx(json!({"name": "world", "n": 3, "flag": true}));
        assert_eq!(
            substitute("hi {{name}} x{{n}} {{flag}}", &c).unwrap(),
            "hi world x3 true"
        );
    }

    #[test]
    fn substitutes_dotted_paths() {
        let c = ctx(json!({"session": {"id": "s-1"}, "a": {"b": {"c": "deep"}}}));
        assert_eq!(substitute("{{session.id}}/{{a.b.c}}", &c).unwrap(), "s-1/deep");
    }

    #[test]
    fn structures_render_as_canonical_json() {
        let c = ctx(json!({"m": {"k": [1, "two"]}, "l": [1, 2]}));
        let rendered = substitute("{{m}}|{{l}}", &c).unwrap();
        let (m, l) = rendered.split_once('|').unwrap();
        assert_eq!(serde_json::from_str::<serde_json::Value>(m).unwrap(), json!({"k": [1, "two"]}));
        assert_eq!(serde_json::from_str::<serde_json::Value>(l).unwrap(), json!([1, 2]));
    }

    #[test]
    fn undefined_variable_lists_available() {
        let c = ctx(json!({"alpha": 1, "beta": 2}));
        let err = substitute("{{gamma}}", &c).unwrap_err().to_string();
        assert!(err.contains("Undefined variable: {{gamma}}"), "{err}");
        assert!(err.contains("alpha, beta"), "{err}");
    }

    #[test]
    fn undefined_nested_key_lists_siblings() {
        let c = ctx(json!({"result": {"found": 1, "other": 2}}));
        let err = substitute("{{result.missing}}", &c).unwrap_err().to_string();
        assert!(err.contains("Key 'missing' not found"), "{err}");
        assert!(err.contains("Available keys at 'result'"), "{err}");
        assert!(err.contains("found, other"), "{err}");
    }

    #[test]
    fn non_map_parent_hints_at_parse_failure() {
        let c = ctx(json!({"result": "plain text"}));
        let err = substitute("{{result.field}}", &c).unwrap_err().to_string();
        assert!(err.contains("it's a string, not a map"), "{err}");
        assert!(err.contains("parse_json"), "{err}");
    }

    #[test]
    fn recursive_substitution_through_structures() {
        let c = ctx(json!({"user": "ada", "n": 2}));
        let input = json!({
            "greeting": "hi {{user}}",
            "nested": {"count": "{{n}}", "fixed": 7},
            "list": ["{{user}}", 1, {"deep": "{{user}}"}]
        });
        let out = substitute_value(&input, &c).unwrap();
        assert_eq!(
            out,
            json!({
                "greeting": "hi ada",
                "nested": {"count": "2", "fixed": 7},
                "list": ["ada", 1, {"deep": "ada"}]
            })
        );
    }

    #[test]
    fn single_reference_resolution() {
        let c = ctx(json!({"items": ["a", "b"]}));
        assert_eq!(
            resolve_single_reference("{{items}}", &c).unwrap(),
            &json!(["a", "b"])
        );
        assert!(resolve_single_reference("prefix {{items}}", &c).is_err());
        assert!(resolve_single_reference("{{missing}}", &c).is_err());
    }

    #[test]
    fn structure_substitution_round_trips() {
        let original = json!({"k": ["x", {"y": 2}], "n": null});
        let c = ctx(json!({"v": original.clone()}));
        let rendered = substitute("{{v}}", &c).unwrap();
        assert_eq!(serde_json::from_str::<serde_json::Value>(&rendered).unwrap(), original);
    }
}
