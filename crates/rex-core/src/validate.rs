// Rex Core - Structural validation of recipes
//
// Validation collects every violation instead of stopping at the first,
// so a recipe author sees the full list in one pass. Errors block
// execution; warnings do not.

use std::collections::HashSet;

use crate::error::{RexError, RexResult};
use crate::recipe::{
    ApprovalConfig, BackoffConfig, RateLimitConfig, Recipe, RecursionConfig, Stage, Step, StepKind,
};

/// Output names the engine reserves for injected metadata
pub const RESERVED_OUTPUT_NAMES: &[&str] = &["recipe", "session", "step", "stage"];

/// Validation outcome: all errors and warnings found
#[derive(Debug, Clone, Default)]
pub struct Validation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

fn is_name(s: &str, extra: &[char]) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || extra.contains(&c))
}

/// Alphanumeric plus underscores; the rule for output and variable names
fn is_var_name(s: &str) -> bool {
    is_name(s, &['_'])
}

/// Validate a recipe against the structural rules.
///
/// Returns every error and warning found.
pub fn validate_recipe(recipe: &Recipe) -> Validation {
    let mut v = Validation::default();

    if recipe.name.is_empty() {
        v.errors.push("Recipe missing required field: name".into());
    } else if !is_name(&recipe.name, &['-', '_']) {
        v.errors
            .push("Recipe name must be alphanumeric with hyphens/underscores".into());
    }

    if recipe.description.is_empty() {
        v.errors
            .push("Recipe missing required field: description".into());
    }

    validate_version(&recipe.version, &mut v.errors);

    if recipe.steps.is_empty() && recipe.stages.is_empty() {
        v.errors
            .push("Recipe must have at least one step or stage".into());
    }

    if recipe.is_staged() {
        validate_staged(recipe, &mut v);
    } else {
        validate_flat(recipe, &mut v);
    }

    if let Some(recursion) = &recipe.recursion {
        validate_recursion(recursion, &mut v.errors);
    }
    if let Some(rate) = &recipe.rate_limiting {
        validate_rate_limiting(rate, &mut v);
    }

    v
}

/// Validate and convert the error list into a single `RexError`
pub fn ensure_valid(recipe: &Recipe) -> RexResult<()> {
    let v = validate_recipe(recipe);
    if v.is_valid() {
        Ok(())
    } else {
        Err(RexError::validation(v.errors.join("; ")))
    }
}

fn validate_version(version: &str, errors: &mut Vec<String>) {
    if version.is_empty() {
        errors.push("Recipe missing required field: version".into());
        return;
    }
    if version.starts_with('v') {
        errors.push(
            "Recipe version must follow semver format without 'v' prefix (use '1.0.0' not 'v1.0.0')"
                .into(),
        );
        return;
    }
    if version.contains('-') || version.contains('+') {
        errors.push(
            "Recipe version must follow simple semver format (MAJOR.MINOR.PATCH only, no pre-release tags)"
                .into(),
        );
        return;
    }
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3 {
        errors.push("Recipe version must follow semver format (MAJOR.MINOR.PATCH)".into());
    } else if !parts
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    {
        errors.push("Recipe version parts must be numeric (e.g., '1.0.0' not '1.a.0')".into());
    }
}

fn validate_flat(recipe: &Recipe, v: &mut Validation) {
    for step in &recipe.steps {
        validate_step(step, None, &mut v.errors);
    }
    check_duplicate_ids(recipe.steps.iter().map(|s| s.id.as_str()), None, v);
    check_depends_on(recipe.steps.iter(), recipe, v);
}

fn validate_staged(recipe: &Recipe, v: &mut Validation) {
    let mut seen_stages = HashSet::new();
    let mut duplicate_stages = HashSet::new();
    for stage in &recipe.stages {
        if !seen_stages.insert(stage.name.as_str()) {
            duplicate_stages.insert(stage.name.as_str());
        }
        validate_stage(stage, v);
    }
    if !duplicate_stages.is_empty() {
        let mut names: Vec<&str> = duplicate_stages.into_iter().collect();
        names.sort_unstable();
        v.errors
            .push(format!("Duplicate stage names: {}", names.join(", ")));
    }

    check_duplicate_ids(
        recipe
            .stages
            .iter()
            .flat_map(|s| s.steps.iter())
            .map(|s| s.id.as_str()),
        Some("across stages"),
        v,
    );
    check_depends_on(recipe.stages.iter().flat_map(|s| s.steps.iter()), recipe, v);
}

fn validate_stage(stage: &Stage, v: &mut Validation) {
    if stage.name.is_empty() {
        v.errors.push("Stage missing required field: name".into());
    } else if !is_name(&stage.name, &['-', '_', ' ']) {
        v.errors.push(format!(
            "Stage name must be alphanumeric with hyphens/underscores/spaces, got '{}'",
            stage.name
        ));
    }

    if stage.steps.is_empty() {
        v.errors
            .push(format!("Stage '{}': must have at least one step", stage.name));
    }

    for step in &stage.steps {
        validate_step(step, Some(&stage.name), &mut v.errors);
    }

    if let Some(approval) = &stage.approval {
        validate_approval(approval, &stage.name, &mut v.errors);
    }
}

fn validate_approval(approval: &ApprovalConfig, stage_name: &str, errors: &mut Vec<String>) {
    if approval.required && approval.prompt.is_empty() {
        errors.push(format!(
            "Stage '{stage_name}': approval.prompt is required when approval.required is true"
        ));
    }
}

fn validate_recursion(config: &RecursionConfig, errors: &mut Vec<String>) {
    if !(1..=20).contains(&config.max_depth) {
        errors.push(format!(
            "recursion.max_depth must be 1-20, got {}",
            config.max_depth
        ));
    }
    if !(1..=1000).contains(&config.max_total_steps) {
        errors.push(format!(
            "recursion.max_total_steps must be 1-1000, got {}",
            config.max_total_steps
        ));
    }
}

fn validate_rate_limiting(config: &RateLimitConfig, v: &mut Validation) {
    if let Some(n) = config.max_concurrent_llm {
        if n < 1 {
            v.errors
                .push(format!("rate_limiting.max_concurrent_llm must be >= 1, got {n}"));
        } else if n > 100 {
            v.warnings.push(format!(
                "rate_limiting.max_concurrent_llm unusually high ({n}), consider a lower value"
            ));
        }
    }
    if config.min_delay_ms > 60_000 {
        v.warnings.push(format!(
            "rate_limiting.min_delay_ms unusually high ({}ms), consider a lower value",
            config.min_delay_ms
        ));
    }
    validate_backoff(&config.backoff, &mut v.errors);
}

fn validate_backoff(config: &BackoffConfig, errors: &mut Vec<String>) {
    if config.initial_delay_ms < 100 {
        errors.push(format!(
            "backoff.initial_delay_ms must be >= 100, got {}",
            config.initial_delay_ms
        ));
    }
    if config.max_delay_ms < config.initial_delay_ms {
        errors.push(format!(
            "backoff.max_delay_ms must be >= initial_delay_ms, got {} < {}",
            config.max_delay_ms, config.initial_delay_ms
        ));
    }
    if config.multiplier < 1.0 {
        errors.push(format!(
            "backoff.multiplier must be >= 1.0, got {}",
            config.multiplier
        ));
    }
    if config.reset_after_success < 1 {
        errors.push(format!(
            "backoff.reset_after_success must be >= 1, got {}",
            config.reset_after_success
        ));
    }
}

fn validate_step(step: &Step, stage: Option<&str>, errors: &mut Vec<String>) {
    let mut push = |msg: String| match stage {
        Some(stage) => errors.push(format!("Stage '{stage}': {msg}")),
        None => errors.push(msg),
    };

    if step.id.is_empty() {
        push("Step missing required field: id".into());
        return;
    }
    let id = &step.id;

    match step.kind {
        StepKind::Agent => {
            if step.agent.is_none() {
                push(format!("Step '{id}': agent steps require 'agent' field"));
            }
            if step.prompt.is_none() {
                push(format!("Step '{id}': agent steps require 'prompt' field"));
            }
            if step.recipe.is_some() {
                push(format!("Step '{id}': agent steps cannot have 'recipe' field"));
            }
            if step.step_context.is_some() {
                push(format!("Step '{id}': agent steps cannot have 'context' field"));
            }
            if step.command.is_some() {
                push(format!("Step '{id}': agent steps cannot have 'command' field"));
            }
        }
        StepKind::Recipe => {
            if step.recipe.is_none() {
                push(format!("Step '{id}': recipe steps require 'recipe' field"));
            }
            if step.agent.is_some() {
                push(format!("Step '{id}': recipe steps cannot have 'agent' field"));
            }
            if step.prompt.is_some() {
                push(format!("Step '{id}': recipe steps cannot have 'prompt' field"));
            }
            if step.mode.is_some() {
                push(format!("Step '{id}': recipe steps cannot have 'mode' field"));
            }
            if step.command.is_some() {
                push(format!("Step '{id}': recipe steps cannot have 'command' field"));
            }
            if let Some(recursion) = &step.recursion {
                let mut nested = Vec::new();
                validate_recursion(recursion, &mut nested);
                for msg in nested {
                    push(format!("Step '{id}': {msg}"));
                }
            }
        }
        StepKind::Bash => {
            match &step.command {
                None => push(format!("Step '{id}': bash steps require 'command' field")),
                Some(cmd) if cmd.trim().is_empty() => {
                    push(format!("Step '{id}': bash command cannot be empty or whitespace"))
                }
                _ => {}
            }
            if step.agent.is_some() {
                push(format!("Step '{id}': bash steps cannot have 'agent' field"));
            }
            if step.prompt.is_some() {
                push(format!("Step '{id}': bash steps cannot have 'prompt' field"));
            }
            if step.mode.is_some() {
                push(format!("Step '{id}': bash steps cannot have 'mode' field"));
            }
            if step.agent_config.is_some() {
                push(format!("Step '{id}': bash steps cannot have 'agent_config' field"));
            }
            if step.recipe.is_some() {
                push(format!("Step '{id}': bash steps cannot have 'recipe' field"));
            }
            if step.step_context.is_some() {
                push(format!("Step '{id}': bash steps cannot have 'context' field"));
            }
            if step.recursion.is_some() {
                push(format!("Step '{id}': bash steps cannot have 'recursion' field"));
            }
            if let Some(name) = &step.output_exit_code {
                if !is_var_name(name) {
                    push(format!(
                        "Step '{id}': output_exit_code must be alphanumeric with underscores"
                    ));
                }
                if RESERVED_OUTPUT_NAMES.contains(&name.as_str()) {
                    push(format!("Step '{id}': output_exit_code '{name}' is reserved"));
                }
            }
        }
    }

    if step.timeout == 0 {
        push(format!("Step '{id}': timeout must be positive"));
    }

    if let Some(output) = &step.output {
        if !is_var_name(output) {
            push(format!(
                "Step '{id}': output name must be alphanumeric with underscores"
            ));
        }
        if RESERVED_OUTPUT_NAMES.contains(&output.as_str()) {
            push(format!("Step '{id}': output name '{output}' is reserved"));
        }
    }

    if let Some(retry) = &step.retry {
        if retry.max_attempts == 0 {
            push(format!("Step '{id}': retry.max_attempts must be positive"));
        }
    }

    if let Some(foreach) = &step.foreach {
        if !foreach.contains("{{") {
            push(format!(
                "Step '{id}': foreach must contain a variable reference (e.g., '{{{{items}}}}')"
            ));
        }
        if let Some(as_var) = &step.as_var {
            if !is_var_name(as_var) {
                push(format!("Step '{id}': 'as' must be a valid variable name"));
            }
        }
        if let Some(collect) = &step.collect {
            if !is_var_name(collect) {
                push(format!("Step '{id}': 'collect' must be a valid variable name"));
            }
        }
        if step.max_iterations == 0 {
            push(format!("Step '{id}': max_iterations must be positive"));
        }
    } else if step.parallel.is_parallel() {
        push(format!("Step '{id}': parallel requires foreach"));
    }
}

fn check_duplicate_ids<'a>(
    ids: impl Iterator<Item = &'a str>,
    scope: Option<&str>,
    v: &mut Validation,
) {
    let mut seen = HashSet::new();
    let mut duplicates = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            duplicates.insert(id);
        }
    }
    if !duplicates.is_empty() {
        let mut names: Vec<&str> = duplicates.into_iter().collect();
        names.sort_unstable();
        match scope {
            Some(scope) => v
                .errors
                .push(format!("Duplicate step IDs {}: {}", scope, names.join(", "))),
            None => v
                .errors
                .push(format!("Duplicate step IDs: {}", names.join(", "))),
        }
    }
}

fn check_depends_on<'a>(
    steps: impl Iterator<Item = &'a Step>,
    recipe: &Recipe,
    v: &mut Validation,
) {
    let known: HashSet<&str> = recipe.all_steps().iter().map(|s| s.id.as_str()).collect();
    for step in steps {
        for dep in &step.depends_on {
            if !known.contains(dep.as_str()) {
                v.errors.push(format!(
                    "Step '{}': depends_on references unknown step '{}'",
                    step.id, dep
                ));
            }
            if dep == &step.id {
                v.errors
                    .push(format!("Step '{}': cannot depend on itself", step.id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Recipe;

    fn flat(yaml: &str) -> Recipe {
        Recipe::from_yaml_str(yaml).unwrap()
    }

    #[test]
    fn valid_recipe_passes() {
        let recipe = flat(
            r#"
name: good-one
description: fine
version: 1.2.3
steps:
  - id: a
    agent: x
    prompt: p
"#,
        );
        let v = validate_recipe(&recipe);
        assert!(v.is_valid(), "{:?}", v.errors);
    }

    #[test]
    fn rejects_bad_versions() {
        for version in ["v1.0.0", "1.0", "1.0.0-beta", "1.a.0"] {
            let recipe = flat(&format!(
                "name: r\ndescription: d\nversion: \"{version}\"\nsteps:\n  - id: a\n    agent: x\n    prompt: p\n"
            ));
            let v = validate_recipe(&recipe);
            assert!(!v.is_valid(), "version {version} should be rejected");
        }
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let recipe = flat(
            r#"
name: r
description: d
version: 1.0.0
steps:
  - id: a
    agent: x
    prompt: p
  - id: a
    agent: x
    prompt: p
"#,
        );
        let v = validate_recipe(&recipe);
        assert!(v.errors.iter().any(|e| e.contains("Duplicate step IDs")));
    }

    #[test]
    fn rejects_kind_field_conflicts() {
        let recipe = flat(
            r#"
name: r
description: d
version: 1.0.0
steps:
  - id: mixed
    type: bash
    command: "ls"
    agent: x
"#,
        );
        let v = validate_recipe(&recipe);
        assert!(v
            .errors
            .iter()
            .any(|e| e.contains("bash steps cannot have 'agent' field")));
    }

    #[test]
    fn rejects_reserved_output_names() {
        let recipe = flat(
            r#"
name: r
description: d
version: 1.0.0
steps:
  - id: a
    agent: x
    prompt: p
    output: session
"#,
        );
        let v = validate_recipe(&recipe);
        assert!(v.errors.iter().any(|e| e.contains("reserved")));
    }

    #[test]
    fn rejects_unknown_depends_on() {
        let recipe = flat(
            r#"
name: r
description: d
version: 1.0.0
steps:
  - id: a
    agent: x
    prompt: p
    depends_on: [ghost]
"#,
        );
        let v = validate_recipe(&recipe);
        assert!(v
            .errors
            .iter()
            .any(|e| e.contains("references unknown step 'ghost'")));
    }

    #[test]
    fn rejects_self_dependency() {
        let recipe = flat(
            r#"
name: r
description: d
version: 1.0.0
steps:
  - id: a
    agent: x
    prompt: p
    depends_on: [a]
"#,
        );
        let v = validate_recipe(&recipe);
        assert!(v.errors.iter().any(|e| e.contains("cannot depend on itself")));
    }

    #[test]
    fn rejects_parallel_without_foreach() {
        let recipe = flat(
            r#"
name: r
description: d
version: 1.0.0
steps:
  - id: a
    agent: x
    prompt: p
    parallel: true
"#,
        );
        let v = validate_recipe(&recipe);
        assert!(v.errors.iter().any(|e| e.contains("parallel requires foreach")));
    }

    #[test]
    fn warns_on_high_concurrency() {
        let recipe = flat(
            r#"
name: r
description: d
version: 1.0.0
rate_limiting:
  max_concurrent_llm: 500
steps:
  - id: a
    agent: x
    prompt: p
"#,
        );
        let v = validate_recipe(&recipe);
        assert!(v.is_valid());
        assert!(v.warnings.iter().any(|w| w.contains("unusually high")));
    }

    #[test]
    fn approval_requires_prompt() {
        let recipe = Recipe::from_yaml_str(
            r#"
name: r
description: d
version: 1.0.0
stages:
  - name: one
    steps:
      - id: a
        agent: x
        prompt: p
    approval:
      required: true
"#,
        )
        .unwrap();
        let v = validate_recipe(&recipe);
        assert!(v
            .errors
            .iter()
            .any(|e| e.contains("approval.prompt is required")));
    }

    #[test]
    fn staged_duplicate_ids_across_stages() {
        let recipe = Recipe::from_yaml_str(
            r#"
name: r
description: d
version: 1.0.0
stages:
  - name: one
    steps:
      - id: a
        agent: x
        prompt: p
  - name: two
    steps:
      - id: a
        agent: x
        prompt: p
"#,
        )
        .unwrap();
        let v = validate_recipe(&recipe);
        assert!(v
            .errors
            .iter()
            .any(|e| e.contains("Duplicate step IDs across stages")));
    }
}
