// Rex Runtime - Step dispatcher
//
// One step at a time: guard condition, foreach delegation, then dispatch
// by kind with the retry policy wrapped around agent calls. Results are
// post-processed (spawn-record unwrap + JSON extraction) before they are
// written into the context.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use rex_core::{
    ensure_valid, evaluate_condition, postprocess_output, substitute, substitute_value,
    BackoffStrategy, Context, OnError, Recipe, RetryConfig, RexError, RexResult, Step, StepKind,
};

use crate::cancel::poll_cancellation;
use crate::coordinator::SpawnRequest;
use crate::executor::{ExecScope, RecipeExecutor};

/// Appended to the prompt when a step sets `parse_json`
const JSON_OUTPUT_INSTRUCTION: &str = r#"

---

**CRITICAL: JSON OUTPUT REQUIRED**

Your response MUST end with a valid JSON object or array. The recipe
system will parse your final JSON output.

Requirements:
1. Your response MUST contain a JSON code block or raw JSON object
2. The JSON must be valid (proper quotes, no trailing commas, etc.)
3. If you include explanation, put the JSON block LAST in your response
4. Use ```json fences or return raw JSON - both work

DO NOT return the JSON as a string or with escape characters. Return
actual JSON structure.
"#;

/// How one step left the executor's loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    /// Ran (or was an empty foreach); checkpoint advances past it
    Completed,
    /// Guard condition was false; no checkpoint, re-evaluated on resume
    Skipped,
}

impl RecipeExecutor {
    /// Run one step against the context: condition, foreach, kind
    /// dispatch, and output assignment.
    pub(crate) async fn execute_step_in_context(
        &self,
        step: &Step,
        ctx: &mut Context,
        scope: &ExecScope,
    ) -> RexResult<StepOutcome> {
        if let Some(condition) = &step.condition {
            let holds = evaluate_condition(condition, ctx)
                .map_err(|e| RexError::condition(format!("Step '{}': {e}", step.id)))?;
            if !holds {
                debug!("Step '{}' condition false, skipping", step.id);
                ctx.record_skipped(&step.id);
                return Ok(StepOutcome::Skipped);
            }
        }

        if step.foreach.is_some() {
            self.run_foreach(step, ctx, scope).await?;
            return Ok(StepOutcome::Completed);
        }

        let result = self.run_step(step, ctx, scope, true).await?;
        if let Some(output) = &step.output {
            ctx.insert(output.clone(), result);
        }
        Ok(StepOutcome::Completed)
    }

    /// Dispatch a step by kind with the retry policy applied.
    ///
    /// `count_step` is false for parallel foreach iterations, whose agent
    /// slots were reserved up front.
    pub(crate) async fn run_step(
        &self,
        step: &Step,
        ctx: &mut Context,
        scope: &ExecScope,
        count_step: bool,
    ) -> RexResult<Value> {
        if step.kind == StepKind::Agent && count_step {
            scope.recursion.increment_steps()?;
        }

        // Retry wraps agent calls only; other kinds get a single attempt
        let retry = match step.kind {
            StepKind::Agent => step.retry.clone().unwrap_or_default(),
            _ => RetryConfig::default(),
        };
        let max_delay = Duration::from_secs(retry.max_delay);
        let mut delay = Duration::from_secs(retry.initial_delay);
        let mut last_error = None;

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                poll_cancellation(
                    self.coordinator.as_ref(),
                    &self.store,
                    &scope.session_id,
                    &scope.project_path,
                )
                .await?;
                tokio::time::sleep(delay.min(max_delay)).await;
                if retry.backoff == BackoffStrategy::Exponential {
                    delay *= 2;
                }
            }

            match self.execute_kind(step, ctx, scope).await {
                Ok(raw) => {
                    return Ok(postprocess_output(
                        raw,
                        step.parse_json,
                        step.kind == StepKind::Bash,
                    ))
                }
                // Control flow and recursion limits bypass retry and
                // on_error; they are not step failures
                Err(e @ RexError::SkipRemaining)
                | Err(e @ RexError::ApprovalPaused { .. })
                | Err(e @ RexError::Cancelled { .. })
                | Err(e @ RexError::Recursion(..)) => return Err(e),
                Err(e) => {
                    if attempt + 1 < retry.max_attempts {
                        warn!(
                            "Step '{}' attempt {}/{} failed: {e}",
                            step.id,
                            attempt + 1,
                            retry.max_attempts
                        );
                    }
                    last_error = Some(e);
                }
            }
        }

        // Attempts exhausted: the failure policy decides
        let error = last_error
            .unwrap_or_else(|| RexError::step(&step.id, "no attempts were made"));
        match step.on_error {
            OnError::Fail => Err(error),
            OnError::Continue => {
                warn!("Step '{}' failed, continuing with null result: {error}", step.id);
                Ok(Value::Null)
            }
            OnError::SkipRemaining => {
                warn!("Step '{}' failed, skipping remaining steps: {error}", step.id);
                Err(RexError::SkipRemaining)
            }
        }
    }

    async fn execute_kind(
        &self,
        step: &Step,
        ctx: &mut Context,
        scope: &ExecScope,
    ) -> RexResult<Value> {
        match step.kind {
            StepKind::Agent => self.spawn_agent_step(step, ctx, scope).await,
            StepKind::Bash => self.execute_bash_step(step, ctx, scope).await,
            StepKind::Recipe => self.execute_recipe_step(step, ctx, scope).await,
        }
    }

    /// Spawn the step's agent through the coordinator, rate-limited
    async fn spawn_agent_step(
        &self,
        step: &Step,
        ctx: &Context,
        scope: &ExecScope,
    ) -> RexResult<Value> {
        let (agent, prompt) = match (&step.agent, &step.prompt) {
            (Some(agent), Some(prompt)) => (agent, prompt),
            _ => {
                return Err(RexError::step(
                    &step.id,
                    "agent step missing 'agent' or 'prompt'",
                ))
            }
        };

        let mut instruction = substitute(prompt, ctx)?;
        if let Some(mode) = &step.mode {
            instruction = format!("MODE: {mode}\n\n{instruction}");
        }
        if step.parse_json {
            instruction.push_str(JSON_OUTPUT_INSTRUCTION);
        }

        let request = SpawnRequest {
            agent_name: agent.clone(),
            instruction,
            parent_session_id: scope.session_id.clone(),
            agent_config: step.agent_config.clone(),
            sub_session_id: None,
            orchestrator: scope.orchestrator.clone(),
        };

        let permit = scope.limiter.acquire().await;
        let result = self.coordinator.spawn(request).await;
        drop(permit);

        match result {
            Ok(output) => {
                scope.limiter.record_success();
                Ok(output.into_value())
            }
            Err(e) => {
                if e.is_rate_limit() {
                    scope.limiter.record_rate_limited();
                }
                Err(RexError::step(&step.id, e.to_string()))
            }
        }
    }

    /// Run the step's command under `/bin/bash -c` with a hard timeout.
    ///
    /// Recipes rely on bash semantics (pipefail, arrays, brace
    /// expansion); dispatching through `sh` would be non-conforming.
    async fn execute_bash_step(
        &self,
        step: &Step,
        ctx: &mut Context,
        scope: &ExecScope,
    ) -> RexResult<Value> {
        let command_template = step
            .command
            .as_ref()
            .ok_or_else(|| RexError::step(&step.id, "bash step missing 'command'"))?;
        let command = substitute(command_template, ctx)?;

        let cwd = match &step.cwd {
            Some(cwd_template) => {
                let path = PathBuf::from(substitute(cwd_template, ctx)?);
                let path = if path.is_absolute() {
                    path
                } else {
                    scope.project_path.join(path)
                };
                if !path.exists() {
                    return Err(RexError::step(
                        &step.id,
                        format!("cwd does not exist: {}", path.display()),
                    ));
                }
                if !path.is_dir() {
                    return Err(RexError::step(
                        &step.id,
                        format!("cwd is not a directory: {}", path.display()),
                    ));
                }
                path
            }
            None => scope.project_path.clone(),
        };

        let mut cmd = Command::new("/bin/bash");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&cwd)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // Timeout drops the future; the child must die with it
            .kill_on_drop(true);

        // Process environment overlaid with the step's env map
        if let Some(env) = &step.env {
            for (key, value) in env {
                cmd.env(key, substitute(value, ctx)?);
            }
        }

        debug!("Step '{}' running: {command}", step.id);
        let child = cmd
            .spawn()
            .map_err(|e| RexError::step(&step.id, format!("failed to execute command: {e}")))?;

        let output = match tokio::time::timeout(
            Duration::from_secs(step.timeout),
            child.wait_with_output(),
        )
        .await
        {
            Err(_) => {
                return Err(RexError::step(
                    &step.id,
                    format!("command timed out after {}s", step.timeout),
                ))
            }
            Ok(Err(e)) => {
                return Err(RexError::step(
                    &step.id,
                    format!("failed to execute command: {e}"),
                ))
            }
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code().unwrap_or(-1);

        if let Some(exit_var) = &step.output_exit_code {
            ctx.insert(exit_var.clone(), Value::String(exit_code.to_string()));
        }

        // Non-zero exit is fatal only under on_error=fail; otherwise the
        // recipe inspects the exit-code variable itself
        if exit_code != 0 && step.on_error == OnError::Fail {
            let mut message = format!("command failed with exit code {exit_code}");
            if !stderr.trim().is_empty() {
                message.push_str(&format!("\nstderr: {}", stderr.trim()));
            }
            return Err(RexError::step(&step.id, message));
        }

        Ok(Value::String(stdout))
    }

    /// Load and run a sub-recipe with an isolated context.
    ///
    /// The child context is built solely from the step's context map,
    /// with templates (including nested ones) resolved against the
    /// parent context.
    async fn execute_recipe_step(
        &self,
        step: &Step,
        ctx: &Context,
        scope: &ExecScope,
    ) -> RexResult<Value> {
        let path_template = step
            .recipe
            .as_ref()
            .ok_or_else(|| RexError::step(&step.id, "recipe step missing 'recipe'"))?;
        let path_str = substitute(path_template, ctx)?;

        let sub_path = if path_str.starts_with('@') {
            self.coordinator.resolve_mention(&path_str).ok_or_else(|| {
                RexError::step(&step.id, format!("Sub-recipe @mention not found: {path_str}"))
            })?
        } else {
            // Relative paths resolve against the parent recipe's
            // directory so recipes can reference siblings
            let base = scope
                .recipe_path
                .as_deref()
                .and_then(Path::parent)
                .map(Path::to_path_buf)
                .unwrap_or_else(|| scope.project_path.clone());
            let path = base.join(&path_str);
            if !path.exists() {
                return Err(RexError::step(
                    &step.id,
                    format!("Sub-recipe not found: {}", path.display()),
                ));
            }
            path
        };

        let sub_recipe = Recipe::from_yaml_file(&sub_path)?;
        ensure_valid(&sub_recipe)?;
        if sub_recipe.is_staged() {
            return Err(RexError::step(
                &step.id,
                "staged recipes cannot run as sub-recipes",
            ));
        }

        let mut sub_context = Context::new();
        if let Some(step_context) = &step.step_context {
            for (key, value) in step_context {
                sub_context.insert(key.clone(), substitute_value(value, ctx)?);
            }
        }

        let child_recursion = scope.recursion.enter_recipe(&sub_recipe.name, step.recursion);
        child_recursion.check_depth()?;

        let child_scope = ExecScope {
            recipe_path: Some(sub_path),
            recursion: child_recursion,
            ..scope.clone()
        };

        let final_context = self
            .execute_sub_recipe(sub_recipe, sub_context, child_scope)
            .await?;
        Ok(final_context.to_value())
    }
}
