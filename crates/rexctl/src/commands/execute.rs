use std::path::PathBuf;

use serde_json::{json, Map, Value};

use rex_core::{extract_result_summary, validate_recipe, Recipe};
use rex_runtime::RunOutcome;

use super::{failure, failure_with, success, CommandContext};

pub async fn run(ctx: &CommandContext, recipe_path: &str, context_json: Option<&str>) -> Value {
    if recipe_path.starts_with('@') {
        return failure(format!(
            "Could not resolve @mention path: {recipe_path} (no mention resolver in the CLI)"
        ));
    }
    let recipe_path = PathBuf::from(recipe_path);

    let context_vars: Map<String, Value> = match context_json {
        None => Map::new(),
        Some(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return failure("--context must be a JSON object"),
            Err(e) => return failure(format!("Failed to parse --context: {e}")),
        },
    };

    let recipe = match Recipe::from_yaml_file(&recipe_path) {
        Ok(recipe) => recipe,
        Err(e) => return failure(format!("Failed to load recipe: {e}")),
    };

    let validation = validate_recipe(&recipe);
    if !validation.is_valid() {
        return failure_with(
            "Recipe validation failed",
            json!({ "errors": validation.errors, "warnings": validation.warnings }),
        );
    }

    let outcome = ctx
        .executor
        .execute(&recipe, context_vars, &ctx.project_path, Some(&recipe_path))
        .await;
    render_outcome(&recipe, outcome)
}

pub fn render_outcome(
    recipe: &Recipe,
    outcome: rex_core::RexResult<RunOutcome>,
) -> Value {
    match outcome {
        Ok(RunOutcome::Completed {
            session_id,
            context,
        }) => success(json!({
            "status": "completed",
            "recipe": recipe.name,
            "session_id": session_id,
            "summary": extract_result_summary(&context, Some(recipe)),
        })),
        Ok(RunOutcome::Paused {
            session_id,
            stage_name,
            prompt,
        }) => success(json!({
            "status": "paused_for_approval",
            "recipe": recipe.name,
            "session_id": session_id,
            "stage_name": stage_name,
            "approval_prompt": prompt,
            "message": format!(
                "Recipe paused at stage '{stage_name}'. Use 'approve' or 'deny' to continue."
            ),
        })),
        Ok(RunOutcome::Cancelled { session_id }) => success(json!({
            "status": "cancelled",
            "recipe": recipe.name,
            "session_id": session_id,
            "message": "Recipe cancelled. Use 'resume' to restart from the last checkpoint.",
        })),
        Err(e) => failure(format!("Recipe execution failed: {e}")),
    }
}
