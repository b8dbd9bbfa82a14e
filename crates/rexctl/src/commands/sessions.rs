use serde_json::{json, Value};

use super::{failure, success, CommandContext};

pub async fn list(ctx: &CommandContext) -> Value {
    match ctx.store.list(&ctx.project_path).await {
        Ok(sessions) => success(json!({
            "count": sessions.len(),
            "sessions": sessions,
        })),
        Err(e) => failure(format!("Failed to list sessions: {e}")),
    }
}
