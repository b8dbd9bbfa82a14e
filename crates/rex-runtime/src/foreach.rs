// Rex Runtime - Foreach loop runner
//
// Iterates a step over a resolved collection, sequentially or with
// bounded parallelism. No partial checkpointing: a loop that fails or is
// cancelled restarts from iteration 0 on resume. The loop variable is
// scoped to the loop; sequential iterations share the parent context,
// parallel iterations each get their own copy and only the collected
// results flow back.

use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::debug;

use rex_core::{resolve_single_reference, Context, Parallelism, RexError, RexResult, Step, StepKind};

use crate::cancel::poll_cancellation;
use crate::executor::{ExecScope, RecipeExecutor};

/// Default loop variable name
const DEFAULT_LOOP_VAR: &str = "item";

impl RecipeExecutor {
    /// Run a step's foreach loop and store its results.
    ///
    /// With `collect` set, the ordered list of per-iteration results is
    /// stored under that key (an empty list for an empty collection, so
    /// downstream length checks work). Otherwise a plain `output` key
    /// receives the last iteration's result.
    pub(crate) async fn run_foreach(
        &self,
        step: &Step,
        ctx: &mut Context,
        scope: &ExecScope,
    ) -> RexResult<()> {
        let foreach = step
            .foreach
            .as_ref()
            .ok_or_else(|| RexError::step(&step.id, "foreach step missing 'foreach'"))?;

        let items: Vec<Value> = {
            let value = resolve_single_reference(foreach, ctx)
                .map_err(|e| RexError::step(&step.id, e.to_string()))?;
            match value {
                Value::Array(items) => items.clone(),
                other => {
                    return Err(RexError::step(
                        &step.id,
                        format!(
                            "foreach variable must be a list, got {}",
                            match other {
                                Value::Null => "null",
                                Value::Bool(_) => "bool",
                                Value::Number(_) => "number",
                                Value::String(_) => "string",
                                Value::Object(_) => "map",
                                Value::Array(_) => "list",
                            }
                        ),
                    ))
                }
            }
        };

        if items.is_empty() {
            // Skip execution but still define the collect output so
            // downstream steps can check its length
            debug!("Step '{}' foreach is empty, skipping", step.id);
            ctx.record_skipped(&step.id);
            if let Some(collect) = &step.collect {
                ctx.insert(collect.clone(), Value::Array(Vec::new()));
            }
            return Ok(());
        }

        if items.len() > step.max_iterations {
            return Err(RexError::step(
                &step.id,
                format!(
                    "foreach exceeds max_iterations ({} > {})",
                    items.len(),
                    step.max_iterations
                ),
            ));
        }

        let loop_var = step.as_var.as_deref().unwrap_or(DEFAULT_LOOP_VAR);

        let results = if step.parallel.is_parallel() {
            self.run_loop_parallel(step, ctx, scope, items, loop_var)
                .await?
        } else {
            self.run_loop_sequential(step, ctx, scope, items, loop_var)
                .await?
        };

        if let Some(collect) = &step.collect {
            ctx.insert(collect.clone(), Value::Array(results));
        } else if let Some(output) = &step.output {
            if let Some(last) = results.into_iter().last() {
                ctx.insert(output.clone(), last);
            }
        }
        Ok(())
    }

    /// One iteration at a time against the shared context
    async fn run_loop_sequential(
        &self,
        step: &Step,
        ctx: &mut Context,
        scope: &ExecScope,
        items: Vec<Value>,
        loop_var: &str,
    ) -> RexResult<Vec<Value>> {
        let mut results = Vec::with_capacity(items.len());

        for (index, item) in items.into_iter().enumerate() {
            poll_cancellation(
                self.coordinator.as_ref(),
                &self.store,
                &scope.session_id,
                &scope.project_path,
            )
            .await?;

            ctx.insert(loop_var.to_string(), item);
            let outcome = self.run_step(step, ctx, scope, true).await;
            // Loop variable is scoped to the iteration, success or not
            ctx.remove(loop_var);

            match outcome {
                Ok(result) => results.push(result),
                Err(e @ RexError::SkipRemaining)
                | Err(e @ RexError::Cancelled { .. })
                | Err(e @ RexError::Recursion(..)) => return Err(e),
                Err(e) => {
                    return Err(RexError::step(
                        &step.id,
                        format!("iteration {index} failed: {e}"),
                    ))
                }
            }
        }

        Ok(results)
    }

    /// All iterations concurrently, each against its own context copy.
    ///
    /// Results come back in input order; the first error wins and the
    /// remaining outcomes are discarded.
    async fn run_loop_parallel(
        &self,
        step: &Step,
        ctx: &Context,
        scope: &ExecScope,
        items: Vec<Value>,
        loop_var: &str,
    ) -> RexResult<Vec<Value>> {
        // Reserve the whole fan-out against the step budget up front
        if step.kind == StepKind::Agent {
            scope.recursion.reserve(items.len())?;
        }

        poll_cancellation(
            self.coordinator.as_ref(),
            &self.store,
            &scope.session_id,
            &scope.project_path,
        )
        .await?;

        let semaphore = match step.parallel {
            Parallelism::Bounded(n) => Some(Arc::new(Semaphore::new(n))),
            _ => None,
        };

        let iterations = items.into_iter().enumerate().map(|(index, item)| {
            let mut iter_ctx = ctx.clone();
            iter_ctx.insert(loop_var.to_string(), item);
            let semaphore = semaphore.clone();
            async move {
                // The semaphore is never closed
                let _permit = match &semaphore {
                    Some(semaphore) => semaphore.acquire().await.ok(),
                    None => None,
                };
                match self.run_step(step, &mut iter_ctx, scope, false).await {
                    Ok(result) => Ok(result),
                    Err(e @ RexError::SkipRemaining)
                    | Err(e @ RexError::Cancelled { .. })
                    | Err(e @ RexError::Recursion(..)) => Err(e),
                    Err(e) => Err(RexError::step(
                        &step.id,
                        format!("iteration {index} failed: {e}"),
                    )),
                }
            }
        });

        try_join_all(iterations).await
    }
}
