// Rex Runtime - Staged executor
//
// Stage-scoped step loop with an approval-gate state machine between
// stages. At a gate the advanced state (next stage, step 0) is saved
// before the pending marker is set, so a crash between the two still
// persists a resumable approval request.

use serde_json::json;

use rex_core::{Recipe, RexError, RexResult, Stage};
use rex_session::{ApprovalStatus, SessionState};

use crate::cancel::poll_cancellation;
use crate::dispatch::StepOutcome;
use crate::executor::flat::step_kind_name;
use crate::executor::{ExecScope, RecipeExecutor};

impl RecipeExecutor {
    /// Execute a staged recipe from the state's current stage and step.
    pub(crate) async fn run_staged(
        &self,
        recipe: &Recipe,
        state: &mut SessionState,
        scope: &ExecScope,
        checkpoint: bool,
        is_resuming: bool,
    ) -> RexResult<()> {
        if is_resuming {
            self.resolve_pending_approval(state, scope).await?;
        }

        let resume_stage = state.current_stage_index;
        let resume_step = state.current_step_in_stage;
        let total_stages = recipe.stages.len();

        for stage_index in resume_stage..recipe.stages.len() {
            let stage = &recipe.stages[stage_index];

            poll_cancellation(
                self.coordinator.as_ref(),
                &self.store,
                &scope.session_id,
                &scope.project_path,
            )
            .await?;

            self.show_progress(&format!(
                "Stage {}/{}: {}",
                stage_index + 1,
                total_stages,
                stage.name
            ));
            state
                .context
                .insert("stage", json!({"name": stage.name, "index": stage_index}));

            let start_step = if stage_index == resume_stage {
                resume_step
            } else {
                0
            };
            self.run_stage_steps(stage, stage_index, start_step, state, scope, checkpoint)
                .await?;

            state.completed_stages.push(stage.name.clone());
            state.current_stage_index = stage_index + 1;
            state.current_step_in_stage = 0;

            if let Some(approval) = stage.approval.as_ref().filter(|a| a.required) {
                let prompt = if approval.prompt.is_empty() {
                    format!("Approve completion of stage '{}'?", stage.name)
                } else {
                    approval.prompt.clone()
                };

                if checkpoint {
                    // Save the advanced state first; the pending marker
                    // piggy-backs on it
                    self.store
                        .save(&scope.session_id, &scope.project_path, state)
                        .await?;
                    self.store
                        .set_pending_approval(
                            &scope.session_id,
                            &scope.project_path,
                            &stage.name,
                            &prompt,
                            approval.timeout,
                            approval.default,
                        )
                        .await?;
                }

                return Err(RexError::ApprovalPaused {
                    session_id: scope.session_id.clone(),
                    stage_name: stage.name.clone(),
                    prompt,
                });
            }

            if checkpoint {
                self.store
                    .save(&scope.session_id, &scope.project_path, state)
                    .await?;
            }
        }

        Ok(())
    }

    /// Steps of one stage, in declared order
    async fn run_stage_steps(
        &self,
        stage: &Stage,
        stage_index: usize,
        start_step: usize,
        state: &mut SessionState,
        scope: &ExecScope,
        checkpoint: bool,
    ) -> RexResult<()> {
        let total = stage.steps.len();

        for step_index in start_step..stage.steps.len() {
            let step = &stage.steps[step_index];

            poll_cancellation(
                self.coordinator.as_ref(),
                &self.store,
                &scope.session_id,
                &scope.project_path,
            )
            .await?;

            state.context.insert(
                "step",
                json!({"id": step.id, "index": step_index, "stage": stage.name}),
            );
            self.show_progress(&format!(
                "  [{}/{}] {} ({})",
                step_index + 1,
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
                    state.current_stage_index = stage_index;
                    state.current_step_in_stage = step_index + 1;
                    if checkpoint {
                        self.store
                            .save(&scope.session_id, &scope.project_path, state)
                            .await?;
                    }
                }
                // Skip-remaining ends this stage's steps; the stage
                // itself still completes
                Err(RexError::SkipRemaining) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Resume-time approval state machine.
    ///
    /// The recorded stage decision wins over the wall clock, so an
    /// explicit denial is never overridden by an approve-by-default
    /// timeout.
    async fn resolve_pending_approval(
        &self,
        state: &mut SessionState,
        scope: &ExecScope,
    ) -> RexResult<()> {
        let Some(pending) = self
            .store
            .get_pending_approval(&scope.session_id, &scope.project_path)
            .await?
        else {
            return Ok(());
        };
        let stage_name = pending.stage_name.clone();

        let status = self
            .store
            .get_stage_approval_status(&scope.session_id, &scope.project_path, &stage_name)
            .await?
            .unwrap_or(ApprovalStatus::Pending);

        match status {
            ApprovalStatus::Approved => {
                self.store
                    .clear_pending_approval(&scope.session_id, &scope.project_path)
                    .await?;
                state.pending_approval = None;
                Ok(())
            }
            ApprovalStatus::Denied => {
                let reason = state
                    .stage_approvals
                    .get(&stage_name)
                    .and_then(|a| a.reason.clone())
                    .unwrap_or_else(|| "Denied by user".to_string());
                Err(RexError::ApprovalDenied { stage_name, reason })
            }
            ApprovalStatus::Timeout => Err(RexError::ApprovalTimeout { stage_name }),
            ApprovalStatus::Pending => {
                match self
                    .store
                    .check_approval_timeout(&scope.session_id, &scope.project_path)
                    .await?
                {
                    ApprovalStatus::Timeout => Err(RexError::ApprovalTimeout { stage_name }),
                    ApprovalStatus::Approved => {
                        // Approved by the timeout default
                        self.store
                            .clear_pending_approval(&scope.session_id, &scope.project_path)
                            .await?;
                        state.pending_approval = None;
                        Ok(())
                    }
                    _ => Err(RexError::ApprovalPaused {
                        session_id: scope.session_id.clone(),
                        stage_name,
                        prompt: pending.prompt,
                    }),
                }
            }
        }
    }
}
