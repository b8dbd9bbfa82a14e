// Rex Runtime - Coordinator capabilities
//
// The engine never talks to an LLM or the terminal directly. The host
// provides a Coordinator: agent spawning, @mention resolution, the
// process-wide cancellation signal, and an optional display sink.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::{error, info, warn};

use rex_core::{OrchestratorConfig, RexResult};

/// Severity of a progress message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

/// Request to spawn an agent sub-session
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Agent to spawn
    pub agent_name: String,

    /// Fully resolved instruction text
    pub instruction: String,

    /// Session the spawned agent belongs under
    pub parent_session_id: String,

    /// Opaque per-agent configuration from the step
    pub agent_config: Option<Map<String, Value>>,

    /// Sub-session id; None lets the spawner generate one
    pub sub_session_id: Option<String>,

    /// Orchestrator settings forwarded from the recipe
    pub orchestrator: Option<OrchestratorConfig>,
}

/// Opaque spawner record. The `output` field carries the agent's text;
/// anything else the spawner returns is preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnOutput {
    pub output: Value,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SpawnOutput {
    /// A plain-text spawn result
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: Value::String(output.into()),
            extra: Map::new(),
        }
    }

    /// The record as a JSON value for post-processing
    pub fn into_value(self) -> Value {
        let mut map = self.extra;
        map.insert("output".into(), self.output);
        Value::Object(map)
    }
}

/// Host capabilities the engine consumes
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Spawn an agent and wait for its result
    async fn spawn(&self, request: SpawnRequest) -> RexResult<SpawnOutput>;

    /// Resolve an `@namespace:path` mention to a filesystem path
    fn resolve_mention(&self, _mention: &str) -> Option<PathBuf> {
        None
    }

    /// Process-wide cancellation flag (typically wired to SIGINT)
    fn cancellation_requested(&self) -> bool {
        false
    }

    /// Whether the process-wide cancellation is immediate
    fn cancellation_immediate(&self) -> bool {
        false
    }

    /// Progress line sink; defaults to tracing
    fn show_message(&self, message: &str, level: MessageLevel) {
        match level {
            MessageLevel::Info => info!(source = "recipe", "{message}"),
            MessageLevel::Warning => warn!(source = "recipe", "{message}"),
            MessageLevel::Error => error!(source = "recipe", "{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spawn_output_round_trips_extra_fields() {
        let parsed: SpawnOutput =
            serde_json::from_value(json!({"output": "hi", "session_id": "sub-1"})).unwrap();
        assert_eq!(parsed.output, json!("hi"));
        assert_eq!(parsed.extra["session_id"], json!("sub-1"));

        let value = parsed.into_value();
        assert_eq!(value["output"], json!("hi"));
        assert_eq!(value["session_id"], json!("sub-1"));
    }
}
