use std::path::PathBuf;

use serde_json::{json, Value};

use rex_core::{validate_recipe, Recipe};

use super::{failure, failure_with, success};

pub fn run(recipe_path: &str) -> Value {
    if recipe_path.starts_with('@') {
        return failure(format!(
            "Could not resolve @mention path: {recipe_path} (no mention resolver in the CLI)"
        ));
    }

    let recipe = match Recipe::from_yaml_file(&PathBuf::from(recipe_path)) {
        Ok(recipe) => recipe,
        Err(e) => return failure(format!("Failed to validate recipe: {e}")),
    };

    let validation = validate_recipe(&recipe);
    if validation.is_valid() {
        success(json!({
            "status": "valid",
            "recipe": recipe.name,
            "version": recipe.version,
            "warnings": validation.warnings,
        }))
    } else {
        failure_with(
            "Recipe validation failed",
            json!({ "errors": validation.errors, "warnings": validation.warnings }),
        )
    }
}
