// Command handlers. Every operation returns a JSON payload: a success
// envelope, an error envelope, or the paused-for-approval form shared by
// execute and resume.

pub mod approvals;
pub mod cancel;
pub mod execute;
pub mod resume;
pub mod sessions;
pub mod validate;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};

use rex_runtime::RecipeExecutor;
use rex_session::SessionStore;

/// Shared handles for command handlers
pub struct CommandContext {
    pub store: Arc<SessionStore>,
    pub executor: RecipeExecutor,
    pub project_path: PathBuf,
}

pub fn success(output: Value) -> Value {
    json!({ "success": true, "output": output })
}

pub fn failure(message: impl Into<String>) -> Value {
    json!({ "success": false, "error": { "message": message.into() } })
}

pub fn failure_with(message: impl Into<String>, details: Value) -> Value {
    let mut error = json!({ "message": message.into() });
    if let (Some(error_map), Some(detail_map)) = (error.as_object_mut(), details.as_object()) {
        for (key, value) in detail_map {
            error_map.insert(key.clone(), value.clone());
        }
    }
    json!({ "success": false, "error": error })
}

/// Whether a payload reports success (drives the exit code)
pub fn is_success(payload: &Value) -> bool {
    payload["success"].as_bool().unwrap_or(false)
}
