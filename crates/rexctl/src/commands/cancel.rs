use serde_json::{json, Value};

use rex_session::CancellationStatus;

use super::{failure, success, CommandContext};

pub async fn run(ctx: &CommandContext, session_id: &str, immediate: bool) -> Value {
    if !ctx.store.session_exists(session_id, &ctx.project_path).await {
        return failure(format!("Session not found: {session_id}"));
    }

    let current = ctx
        .store
        .get_cancellation_status(session_id, &ctx.project_path)
        .await;
    if current == CancellationStatus::Cancelled {
        return failure(format!(
            "Session already cancelled: {session_id}. Use 'resume' to restart."
        ));
    }

    let (ok, message) = match ctx
        .store
        .request_cancellation(session_id, &ctx.project_path, immediate)
        .await
    {
        Ok(result) => result,
        Err(e) => return failure(format!("Failed to cancel session: {e}")),
    };
    if !ok {
        return failure(message);
    }

    let level = if ctx
        .store
        .is_immediate_cancellation(session_id, &ctx.project_path)
        .await
    {
        "immediate"
    } else {
        "graceful"
    };

    success(json!({
        "status": "cancellation_requested",
        "session_id": session_id,
        "level": level,
        "message": message,
        "next_steps": if level == "immediate" {
            "Recipe will stop at the next poll point."
        } else {
            "Recipe will stop after the current step completes. \
             Send another cancel request (or use --immediate) for immediate cancellation."
        },
        "resume_info": "Use 'resume' to restart the recipe from where it stopped.",
    }))
}
