// Rex Core - JSON recovery from step output
//
// Agent output is heterogeneous: prose, markdown, fenced code, or clean
// JSON. Downstream dotted-access needs parsed structures, but forcing
// parsing on prose would mangle non-structured steps. Default behavior is
// conservative (parse only a strict-valid whole string); steps opt in to
// aggressive extraction with `parse_json: true`. Bash output falls back
// to aggressive extraction because commands often print status lines
// before their JSON.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

fn fenced_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\}|\[.*?\])\s*```").unwrap())
}

/// Parse the whole string as strict JSON, or None
fn parse_whole(text: &str) -> Option<Value> {
    serde_json::from_str(text.trim()).ok()
}

/// Decode the first JSON value starting at `text`, ignoring trailing prose
fn decode_prefix(text: &str) -> Option<Value> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Some(value),
        _ => None,
    }
}

/// Best-effort JSON extraction, strategies in order:
///
/// 1. the entire string is valid JSON;
/// 2. the first fenced code block containing an object or array;
/// 3. greedy stream-decode from each top-level `{`, then each `[`.
///
/// Returns None when no strategy yields a value; callers keep the
/// original string in that case.
pub fn extract_json_aggressively(output: &str) -> Option<Value> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(value) = parse_whole(trimmed) {
        return Some(value);
    }

    if let Some(caps) = fenced_regex().captures(trimmed) {
        if let Some(value) = parse_whole(caps.get(1).unwrap().as_str()) {
            debug!("Extracted JSON from fenced code block");
            return Some(value);
        }
    }

    for start_char in ['{', '['] {
        for (idx, _) in trimmed.match_indices(start_char) {
            if let Some(value) = decode_prefix(&trimmed[idx..]) {
                debug!("Extracted embedded JSON at offset {idx}");
                return Some(value);
            }
        }
    }

    None
}

/// Post-process a raw step result.
///
/// Unwraps spawner records carrying an `output` field, then applies JSON
/// extraction: aggressive when `parse_json` is set, otherwise conservative
/// with an aggressive fallback for bash output.
pub fn postprocess_output(result: Value, parse_json: bool, is_bash: bool) -> Value {
    let output = match result {
        Value::Object(mut map) if map.contains_key("output") => {
            map.remove("output").unwrap_or(Value::Null)
        }
        other => other,
    };

    let text = match output {
        Value::String(s) => s,
        other => return other,
    };

    if parse_json {
        return extract_json_aggressively(&text).unwrap_or(Value::String(text));
    }

    let trimmed = text.trim();
    if !trimmed.is_empty() {
        if let Some(value) = parse_whole(trimmed) {
            return value;
        }
        if is_bash {
            if let Some(value) = extract_json_aggressively(trimmed) {
                return value;
            }
        }
    }

    Value::String(text)
}
