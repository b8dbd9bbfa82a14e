use serde_json::{json, Value};

use rex_session::ApprovalStatus;

use super::{failure, success, CommandContext};

pub async fn list(ctx: &CommandContext) -> Value {
    match ctx.store.list_pending_approvals(&ctx.project_path).await {
        Ok(pending) => {
            let entries: Vec<Value> = pending
                .into_iter()
                .map(|(session_id, approval)| {
                    json!({
                        "session_id": session_id,
                        "stage_name": approval.stage_name,
                        "prompt": approval.prompt,
                        "timeout": approval.timeout,
                        "requested_at": approval.requested_at,
                    })
                })
                .collect();
            success(json!({ "count": entries.len(), "pending_approvals": entries }))
        }
        Err(e) => failure(format!("Failed to list approvals: {e}")),
    }
}

/// Shared precondition: the session exists and the named stage is the one
/// actually pending.
async fn check_pending(ctx: &CommandContext, session_id: &str, stage_name: &str) -> Result<(), Value> {
    if !ctx.store.session_exists(session_id, &ctx.project_path).await {
        return Err(failure(format!("Session not found: {session_id}")));
    }

    let pending = match ctx
        .store
        .get_pending_approval(session_id, &ctx.project_path)
        .await
    {
        Ok(Some(pending)) => pending,
        Ok(None) => {
            return Err(failure(format!(
                "No pending approval for session: {session_id}"
            )))
        }
        Err(e) => return Err(failure(format!("Failed to read session: {e}"))),
    };

    if pending.stage_name != stage_name {
        return Err(failure(format!(
            "Stage mismatch: pending approval is for '{}', not '{}'",
            pending.stage_name, stage_name
        )));
    }
    Ok(())
}

pub async fn approve(ctx: &CommandContext, session_id: &str, stage_name: &str) -> Value {
    if let Err(payload) = check_pending(ctx, session_id, stage_name).await {
        return payload;
    }

    match ctx
        .store
        .set_stage_approval_status(
            session_id,
            &ctx.project_path,
            stage_name,
            ApprovalStatus::Approved,
            Some("Approved by user"),
        )
        .await
    {
        Ok(()) => success(json!({
            "status": "approved",
            "session_id": session_id,
            "stage_name": stage_name,
            "message": format!(
                "Stage '{stage_name}' approved. Use 'resume' to continue execution."
            ),
        })),
        Err(e) => failure(format!("Failed to approve stage: {e}")),
    }
}

pub async fn deny(
    ctx: &CommandContext,
    session_id: &str,
    stage_name: &str,
    reason: Option<&str>,
) -> Value {
    if let Err(payload) = check_pending(ctx, session_id, stage_name).await {
        return payload;
    }
    let reason = reason.unwrap_or("Denied by user");

    match ctx
        .store
        .set_stage_approval_status(
            session_id,
            &ctx.project_path,
            stage_name,
            ApprovalStatus::Denied,
            Some(reason),
        )
        .await
    {
        Ok(()) => success(json!({
            "status": "denied",
            "session_id": session_id,
            "stage_name": stage_name,
            "reason": reason,
            "message": format!(
                "Stage '{stage_name}' denied. Recipe execution will not continue."
            ),
        })),
        Err(e) => failure(format!("Failed to deny stage: {e}")),
    }
}
