use serde_json::Value;

use rex_core::Recipe;

use super::{execute::render_outcome, failure, CommandContext};

pub async fn run(ctx: &CommandContext, session_id: &str) -> Value {
    if !ctx.store.session_exists(session_id, &ctx.project_path).await {
        return failure(format!("Session not found: {session_id}"));
    }

    let snapshot = ctx
        .store
        .recipe_snapshot_path(session_id, &ctx.project_path);
    if !snapshot.exists() {
        return failure(format!("Recipe file not found in session: {session_id}"));
    }

    let recipe = match Recipe::from_yaml_file(&snapshot) {
        Ok(recipe) => recipe,
        Err(e) => return failure(format!("Failed to load recipe from session: {e}")),
    };

    let outcome = ctx
        .executor
        .resume(&recipe, session_id, &ctx.project_path)
        .await;
    render_outcome(&recipe, outcome)
}
