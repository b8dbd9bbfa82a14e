// Rex Runtime - Flat executor
//
// Ordered step loop with checkpoint-after-step. Resumption starts at the
// persisted current_step_index against the persisted context; completed
// steps are never re-executed.

use serde_json::json;

use rex_core::{Recipe, RexError, RexResult, StepKind};
use rex_session::SessionState;

use crate::cancel::poll_cancellation;
use crate::dispatch::StepOutcome;
use crate::executor::{ExecScope, RecipeExecutor};

pub(crate) fn step_kind_name(kind: StepKind) -> &'static str {
    match kind {
        StepKind::Agent => "agent",
        StepKind::Bash => "bash",
        StepKind::Recipe => "recipe",
    }
}

impl RecipeExecutor {
    /// Execute a flat recipe's steps from the state's current index.
    ///
    /// With `checkpoint` set, state is persisted after every completed
    /// step; sub-recipes run with it unset and only their final context
    /// survives (as the parent step's result).
    pub(crate) async fn run_flat(
        &self,
        recipe: &Recipe,
        state: &mut SessionState,
        scope: &ExecScope,
        checkpoint: bool,
    ) -> RexResult<()> {
        let total = recipe.steps.len();
        self.show_progress(&format!(
            "Starting recipe: {} ({} steps)",
            recipe.name, total
        ));

        for index in state.current_step_index..recipe.steps.len() {
            let step = &recipe.steps[index];

            poll_cancellation(
                self.coordinator.as_ref(),
                &self.store,
                &scope.session_id,
                &scope.project_path,
            )
            .await?;

            state
                .context
                .insert("step", json!({"id": step.id, "index": index}));
            self.show_progress(&format!(
                "  [{}/{}] {} ({})",
                index + 1,
                total,
                step.id,
                step_kind_name(step.kind)
            ));

            match self
                .execute_step_in_context(step, &mut state.context, scope)
                .await
            {
                Ok(StepOutcome::Skipped) => continue,
                Ok(StepOutcome::Completed) => {
                    state.completed_steps.push(step.id.clone());
                    state.current_step_index = index + 1;
                    if checkpoint {
                        self.store
                            .save(&scope.session_id, &scope.project_path, state)
                            .await?;
                    }
                }
                Err(RexError::SkipRemaining) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}
