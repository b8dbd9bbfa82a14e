// Rex Runtime - Recipe executor
//
// Entry points for executing and resuming recipes. The executor owns the
// orchestration loop; durable state lives in the session store, agent
// spawning and mention resolution live in the coordinator.

mod flat;
mod staged;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use rex_core::{
    ensure_valid, Context, OrchestratorConfig, Recipe, RexError, RexResult,
};
use rex_session::{CancellationStatus, SessionState, SessionStore};

use crate::coordinator::{Coordinator, MessageLevel};
use crate::limiter::RateLimiter;
use crate::recursion::RecursionState;

/// Everything a nested execution inherits from its parent.
///
/// The session id, rate limiter, and step counter are shared across the
/// whole recipe tree; the recipe path and recursion depth are per-level.
#[derive(Clone)]
pub(crate) struct ExecScope {
    pub project_path: PathBuf,
    /// Path of the recipe file driving this level, for sibling resolution
    pub recipe_path: Option<PathBuf>,
    /// Root session id; sub-recipes do not get their own
    pub session_id: String,
    pub recursion: RecursionState,
    pub limiter: Arc<RateLimiter>,
    pub orchestrator: Option<OrchestratorConfig>,
}

/// Terminal outcome of an execute or resume call.
///
/// Pause and cancellation are outcomes, not failures: the session remains
/// on disk and can be resumed.
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        session_id: String,
        context: Context,
    },
    Paused {
        session_id: String,
        stage_name: String,
        prompt: String,
    },
    Cancelled {
        session_id: String,
    },
}

/// Executes recipe workflows with checkpointing and resumption
pub struct RecipeExecutor {
    pub(crate) coordinator: Arc<dyn Coordinator>,
    pub(crate) store: Arc<SessionStore>,
}

impl RecipeExecutor {
    pub fn new(coordinator: Arc<dyn Coordinator>, store: Arc<SessionStore>) -> Self {
        Self { coordinator, store }
    }

    pub(crate) fn show_progress(&self, message: &str) {
        self.coordinator.show_message(message, MessageLevel::Info);
    }

    /// Execute a recipe in a fresh session.
    ///
    /// `context_vars` is merged over the recipe's initial context.
    /// `recipe_path` enables sibling sub-recipe resolution and the
    /// snapshot used by resume.
    pub async fn execute(
        &self,
        recipe: &Recipe,
        context_vars: serde_json::Map<String, serde_json::Value>,
        project_path: &Path,
        recipe_path: Option<&Path>,
    ) -> RexResult<RunOutcome> {
        ensure_valid(recipe)?;
        self.run_root(recipe, context_vars, project_path, recipe_path, None)
            .await
    }

    /// Resume a previously persisted session.
    ///
    /// The recipe is the snapshot stored at session creation. A cancelled
    /// session is cleared back to runnable first.
    pub async fn resume(
        &self,
        recipe: &Recipe,
        session_id: &str,
        project_path: &Path,
    ) -> RexResult<RunOutcome> {
        ensure_valid(recipe)?;
        if !self.store.session_exists(session_id, project_path).await {
            return Err(RexError::session(format!("Session not found: {session_id}")));
        }

        if self
            .store
            .get_cancellation_status(session_id, project_path)
            .await
            == CancellationStatus::Cancelled
        {
            self.store
                .clear_cancellation(session_id, project_path)
                .await?;
        }

        let recipe_path = self
            .store
            .recipe_snapshot_path(session_id, project_path)
            .exists()
            .then(|| self.store.recipe_snapshot_path(session_id, project_path));

        self.run_root(
            recipe,
            serde_json::Map::new(),
            project_path,
            recipe_path.as_deref(),
            Some(session_id.to_string()),
        )
        .await
    }

    /// Top-level execution: session handling plus outcome mapping
    async fn run_root(
        &self,
        recipe: &Recipe,
        context_vars: serde_json::Map<String, serde_json::Value>,
        project_path: &Path,
        recipe_path: Option<&Path>,
        resume_session: Option<String>,
    ) -> RexResult<RunOutcome> {
        let is_resuming = resume_session.is_some();

        let (session_id, mut state) = match resume_session {
            Some(session_id) => {
                let state = self.store.load(&session_id, project_path).await?;
                info!("Resuming session {session_id} for recipe {}", recipe.name);
                (session_id, state)
            }
            None => {
                let session_id = self
                    .store
                    .create(recipe, project_path, recipe_path)
                    .await?;
                let mut state = self.store.load(&session_id, project_path).await?;
                state.context = Context::from_map(recipe.context.clone());
                state.context.overlay(context_vars);
                info!("Created session {session_id} for recipe {}", recipe.name);
                (session_id, state)
            }
        };

        inject_metadata(&mut state, recipe, project_path);

        let scope = ExecScope {
            project_path: project_path.to_path_buf(),
            recipe_path: recipe_path.map(Path::to_path_buf),
            session_id: session_id.clone(),
            recursion: RecursionState::root(
                &recipe.name,
                recipe.recursion.unwrap_or_default(),
            ),
            limiter: Arc::new(RateLimiter::new(
                recipe.rate_limiting.clone().unwrap_or_default(),
            )),
            orchestrator: recipe.orchestrator.clone(),
        };

        let result = if recipe.is_staged() {
            self.run_staged(recipe, &mut state, &scope, true, is_resuming)
                .await
        } else {
            self.run_flat(recipe, &mut state, &scope, true).await
        };

        match result {
            Ok(()) => {
                self.store.cleanup_old_sessions(project_path).await;
                self.show_progress(&format!("Recipe completed: {}", recipe.name));
                Ok(RunOutcome::Completed {
                    session_id,
                    context: state.context,
                })
            }
            Err(RexError::ApprovalPaused {
                session_id,
                stage_name,
                prompt,
            }) => {
                // The staged loop already persisted the advanced state and
                // the pending marker; re-saving here would clobber them
                self.show_progress(&format!(
                    "Recipe paused at stage '{stage_name}' awaiting approval"
                ));
                Ok(RunOutcome::Paused {
                    session_id,
                    stage_name,
                    prompt,
                })
            }
            Err(RexError::Cancelled {
                session_id,
                immediate,
            }) => {
                let cancelled_at_step = current_step_id(recipe, &state);
                // Keep the persisted status monotonic while saving the
                // latest context
                state.cancellation_status = if immediate {
                    CancellationStatus::Immediate
                } else {
                    CancellationStatus::Requested
                };
                self.store.save(&session_id, project_path, &state).await?;
                self.store
                    .mark_cancelled(&session_id, project_path, cancelled_at_step.as_deref())
                    .await?;
                self.show_progress(&format!("Recipe cancelled: {}", recipe.name));
                Ok(RunOutcome::Cancelled { session_id })
            }
            Err(e) => {
                // Keep the last known state for resumption
                debug!("Saving state after failure: {e}");
                let _ = self.store.save(&session_id, project_path, &state).await;
                Err(e)
            }
        }
    }

    /// Execute a sub-recipe in-memory within the parent's session.
    ///
    /// Sub-recipes never checkpoint: the parent's recipe step persists
    /// their final context as its own result. Boxed because recipe steps
    /// recurse back into the executor.
    pub(crate) fn execute_sub_recipe<'a>(
        &'a self,
        recipe: Recipe,
        context_vars: Context,
        scope: ExecScope,
    ) -> Pin<Box<dyn Future<Output = RexResult<Context>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = SessionState::new(
                scope.session_id.clone(),
                recipe.name.clone(),
                recipe.version.clone(),
                false,
                scope.project_path.to_string_lossy().into_owned(),
            );
            state.context = Context::from_map(recipe.context.clone());
            state.context.overlay(context_vars.as_map().clone());
            inject_metadata(&mut state, &recipe, &scope.project_path);

            self.run_flat(&recipe, &mut state, &scope, false).await?;
            Ok(state.context)
        })
    }
}

/// Inject the reserved recipe and session metadata keys
fn inject_metadata(state: &mut SessionState, recipe: &Recipe, project_path: &Path) {
    state.context.insert(
        "recipe",
        json!({
            "name": recipe.name,
            "version": recipe.version,
            "description": recipe.description,
        }),
    );
    state.context.insert(
        "session",
        json!({
            "id": state.session_id,
            "started": state.started.to_rfc3339(),
            "project": project_path.to_string_lossy(),
        }),
    );
}

/// Id of the step execution stopped at, for cancellation bookkeeping
fn current_step_id(recipe: &Recipe, state: &SessionState) -> Option<String> {
    if recipe.is_staged() {
        recipe
            .stages
            .get(state.current_stage_index)
            .and_then(|stage| stage.steps.get(state.current_step_in_stage))
            .map(|step| step.id.clone())
    } else {
        recipe
            .steps
            .get(state.current_step_index)
            .map(|step| step.id.clone())
    }
}
