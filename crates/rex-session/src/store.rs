// Rex Session - File-backed session store
//
// Layout: <base_dir>/<project-slug>/sessions/<session_id>/ holding
// state.json and a recipe.yaml snapshot for resumption. Every mutation is
// load-modify-save under a store-level lock, and saves go through a temp
// file + rename so concurrent readers always see a coherent document.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use rex_core::{ApprovalDefault, Recipe, RexError, RexResult};

use crate::state::{
    ApprovalStatus, CancellationStatus, PendingApproval, SessionState, SessionSummary,
    StageApproval,
};

const STATE_FILE: &str = "state.json";
const RECIPE_SNAPSHOT: &str = "recipe.yaml";

/// File-backed store for recipe sessions
pub struct SessionStore {
    base_dir: PathBuf,
    /// Sessions older than this many days are removed during cleanup
    retention_days: i64,
    /// Serializes load-modify-save mutations
    write_lock: Mutex<()>,
}

impl SessionStore {
    /// Create a store rooted at `base_dir` with a 7-day retention window
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_retention(base_dir, 7)
    }

    pub fn with_retention(base_dir: impl Into<PathBuf>, retention_days: i64) -> Self {
        Self {
            base_dir: base_dir.into(),
            retention_days,
            write_lock: Mutex::new(()),
        }
    }

    /// Project directory: readable slug plus a hash to avoid collisions
    fn project_dir(&self, project_path: &Path) -> PathBuf {
        let name = project_path
            .file_name()
            .map(|n| n.to_string_lossy().replace(|c: char| !c.is_ascii_alphanumeric() && c != '-' && c != '_', "-"))
            .unwrap_or_else(|| "root".into());
        let mut hasher = DefaultHasher::new();
        project_path.to_string_lossy().hash(&mut hasher);
        self.base_dir
            .join(format!("{}-{:016x}", name, hasher.finish()))
    }

    /// Directory holding one session's files
    pub fn session_dir(&self, session_id: &str, project_path: &Path) -> PathBuf {
        self.project_dir(project_path)
            .join("sessions")
            .join(session_id)
    }

    fn state_path(&self, session_id: &str, project_path: &Path) -> PathBuf {
        self.session_dir(session_id, project_path).join(STATE_FILE)
    }

    /// Path of the recipe snapshot stored at session creation
    pub fn recipe_snapshot_path(&self, session_id: &str, project_path: &Path) -> PathBuf {
        self.session_dir(session_id, project_path)
            .join(RECIPE_SNAPSHOT)
    }

    pub async fn session_exists(&self, session_id: &str, project_path: &Path) -> bool {
        self.state_path(session_id, project_path).exists()
    }

    /// Create a session for a top-level recipe run.
    ///
    /// Writes the initial state document and, when the recipe file path is
    /// known, snapshots it into the session directory for later resumption.
    pub async fn create(
        &self,
        recipe: &Recipe,
        project_path: &Path,
        recipe_file: Option<&Path>,
    ) -> RexResult<String> {
        let session_id = format!(
            "recipe_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..4]
        );

        let dir = self.session_dir(&session_id, project_path);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            RexError::session(format!("Failed to create session dir {}: {}", dir.display(), e))
        })?;

        let state = SessionState::new(
            session_id.clone(),
            recipe.name.clone(),
            recipe.version.clone(),
            recipe.is_staged(),
            project_path.to_string_lossy().into_owned(),
        );
        self.save(&session_id, project_path, &state).await?;

        if let Some(recipe_file) = recipe_file {
            let snapshot = dir.join(RECIPE_SNAPSHOT);
            if let Err(e) = tokio::fs::copy(recipe_file, &snapshot).await {
                warn!(
                    "Failed to snapshot recipe {} into session: {}",
                    recipe_file.display(),
                    e
                );
            }
        }

        debug!("Created session {session_id}");
        Ok(session_id)
    }

    /// Load a session's state document
    pub async fn load(&self, session_id: &str, project_path: &Path) -> RexResult<SessionState> {
        let path = self.state_path(session_id, project_path);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            RexError::session(format!("Failed to read session {session_id}: {e}"))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            RexError::session(format!("Failed to parse session {session_id} state: {e}"))
        })
    }

    /// Atomically persist a session's state document
    pub async fn save(
        &self,
        session_id: &str,
        project_path: &Path,
        state: &SessionState,
    ) -> RexResult<()> {
        let path = self.state_path(session_id, project_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RexError::session(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| RexError::session(format!("Failed to serialize session state: {e}")))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await.map_err(|e| {
            RexError::session(format!("Failed to write session {session_id}: {e}"))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            RexError::session(format!("Failed to commit session {session_id}: {e}"))
        })
    }

    /// Load, mutate, and save under the store lock
    async fn update<F>(&self, session_id: &str, project_path: &Path, mutate: F) -> RexResult<SessionState>
    where
        F: FnOnce(&mut SessionState) -> RexResult<()>,
    {
        let _guard = self.write_lock.lock().await;
        let mut state = self.load(session_id, project_path).await?;
        mutate(&mut state)?;
        self.save(session_id, project_path, &state).await?;
        Ok(state)
    }

    /// List sessions for a project, removing those past retention
    pub async fn list(&self, project_path: &Path) -> RexResult<Vec<SessionSummary>> {
        self.cleanup_old_sessions(project_path).await;

        let sessions_dir = self.project_dir(project_path).join("sessions");
        let mut summaries = Vec::new();
        let mut entries = match tokio::fs::read_dir(&sessions_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(summaries),
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let session_id = entry.file_name().to_string_lossy().into_owned();
            match self.load(&session_id, project_path).await {
                Ok(state) => summaries.push(SessionSummary::from(&state)),
                Err(e) => debug!("Skipping unreadable session {session_id}: {e}"),
            }
        }

        summaries.sort_by(|a, b| b.started.cmp(&a.started));
        Ok(summaries)
    }

    /// Remove sessions whose state is older than the retention window
    pub async fn cleanup_old_sessions(&self, project_path: &Path) {
        let sessions_dir = self.project_dir(project_path).join("sessions");
        let cutoff = Utc::now() - Duration::days(self.retention_days);

        let mut entries = match tokio::fs::read_dir(&sessions_dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let session_id = entry.file_name().to_string_lossy().into_owned();
            let expired = match self.load(&session_id, project_path).await {
                Ok(state) => state.started < cutoff,
                // Unreadable state: leave it for manual inspection
                Err(_) => false,
            };
            if expired {
                debug!("Removing expired session {session_id}");
                if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                    warn!("Failed to remove expired session {session_id}: {e}");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Approval API
    // ------------------------------------------------------------------

    /// Record a pending approval request on the session
    pub async fn set_pending_approval(
        &self,
        session_id: &str,
        project_path: &Path,
        stage_name: &str,
        prompt: &str,
        timeout: u64,
        default: ApprovalDefault,
    ) -> RexResult<()> {
        self.update(session_id, project_path, |state| {
            state.pending_approval = Some(PendingApproval {
                stage_name: stage_name.to_string(),
                prompt: prompt.to_string(),
                timeout,
                default,
                requested_at: Utc::now(),
            });
            state.stage_approvals.insert(
                stage_name.to_string(),
                StageApproval {
                    status: ApprovalStatus::Pending,
                    reason: None,
                    decided_at: Utc::now(),
                },
            );
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn get_pending_approval(
        &self,
        session_id: &str,
        project_path: &Path,
    ) -> RexResult<Option<PendingApproval>> {
        Ok(self.load(session_id, project_path).await?.pending_approval)
    }

    pub async fn clear_pending_approval(
        &self,
        session_id: &str,
        project_path: &Path,
    ) -> RexResult<()> {
        self.update(session_id, project_path, |state| {
            state.pending_approval = None;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Record an approval decision for a stage
    pub async fn set_stage_approval_status(
        &self,
        session_id: &str,
        project_path: &Path,
        stage_name: &str,
        status: ApprovalStatus,
        reason: Option<&str>,
    ) -> RexResult<()> {
        self.update(session_id, project_path, |state| {
            state.stage_approvals.insert(
                stage_name.to_string(),
                StageApproval {
                    status,
                    reason: reason.map(str::to_string),
                    decided_at: Utc::now(),
                },
            );
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn get_stage_approval_status(
        &self,
        session_id: &str,
        project_path: &Path,
        stage_name: &str,
    ) -> RexResult<Option<ApprovalStatus>> {
        Ok(self
            .load(session_id, project_path)
            .await?
            .stage_approvals
            .get(stage_name)
            .map(|a| a.status))
    }

    /// Resolve a pending approval against the wall clock.
    ///
    /// Returns Pending while the decision is open, Approved when the
    /// timeout elapsed with default=approve (recording the decision), and
    /// Timeout when it elapsed with default=deny (recording a denial).
    /// timeout=0 means wait forever.
    pub async fn check_approval_timeout(
        &self,
        session_id: &str,
        project_path: &Path,
    ) -> RexResult<ApprovalStatus> {
        let state = self.load(session_id, project_path).await?;
        let Some(pending) = &state.pending_approval else {
            return Ok(ApprovalStatus::Pending);
        };
        if pending.timeout == 0 {
            return Ok(ApprovalStatus::Pending);
        }

        let deadline = pending.requested_at + Duration::seconds(pending.timeout as i64);
        if Utc::now() < deadline {
            return Ok(ApprovalStatus::Pending);
        }

        let stage_name = pending.stage_name.clone();
        match pending.default {
            ApprovalDefault::Approve => {
                self.set_stage_approval_status(
                    session_id,
                    project_path,
                    &stage_name,
                    ApprovalStatus::Approved,
                    Some("Approved by timeout default"),
                )
                .await?;
                Ok(ApprovalStatus::Approved)
            }
            ApprovalDefault::Deny => {
                self.set_stage_approval_status(
                    session_id,
                    project_path,
                    &stage_name,
                    ApprovalStatus::Timeout,
                    Some("Denied by timeout"),
                )
                .await?;
                Ok(ApprovalStatus::Timeout)
            }
        }
    }

    /// Pending approvals across every session of the project
    pub async fn list_pending_approvals(
        &self,
        project_path: &Path,
    ) -> RexResult<Vec<(String, PendingApproval)>> {
        let mut pending = Vec::new();
        for summary in self.list(project_path).await? {
            if summary.pending_approval.is_some() {
                let state = self.load(&summary.session_id, project_path).await?;
                if let Some(approval) = state.pending_approval {
                    pending.push((summary.session_id, approval));
                }
            }
        }
        Ok(pending)
    }

    // ------------------------------------------------------------------
    // Cancellation API
    // ------------------------------------------------------------------

    /// Request cancellation, upgrading monotonically.
    ///
    /// A graceful request on an already-graceful session upgrades to
    /// immediate. Returns a user-facing message describing the result.
    pub async fn request_cancellation(
        &self,
        session_id: &str,
        project_path: &Path,
        immediate: bool,
    ) -> RexResult<(bool, String)> {
        let mut message = String::new();
        let mut ok = true;
        self.update(session_id, project_path, |state| {
            match state.cancellation_status {
                CancellationStatus::Cancelled => {
                    ok = false;
                    message = format!("Session already cancelled: {session_id}");
                }
                CancellationStatus::Immediate => {
                    message = "Immediate cancellation already requested".into();
                }
                CancellationStatus::Requested => {
                    // A repeated request escalates
                    state.cancellation_status = CancellationStatus::Immediate;
                    message = "Upgraded to immediate cancellation".into();
                }
                CancellationStatus::None => {
                    state.cancellation_status = if immediate {
                        CancellationStatus::Immediate
                    } else {
                        CancellationStatus::Requested
                    };
                    message = if immediate {
                        "Immediate cancellation requested".into()
                    } else {
                        "Graceful cancellation requested; current step will complete".into()
                    };
                }
            }
            Ok(())
        })
        .await?;
        Ok((ok, message))
    }

    /// Current cancellation status; None for unknown sessions
    pub async fn get_cancellation_status(
        &self,
        session_id: &str,
        project_path: &Path,
    ) -> CancellationStatus {
        match self.load(session_id, project_path).await {
            Ok(state) => state.cancellation_status,
            Err(_) => CancellationStatus::None,
        }
    }

    pub async fn is_cancellation_requested(&self, session_id: &str, project_path: &Path) -> bool {
        self.get_cancellation_status(session_id, project_path)
            .await
            .is_requested()
    }

    pub async fn is_immediate_cancellation(&self, session_id: &str, project_path: &Path) -> bool {
        self.get_cancellation_status(session_id, project_path)
            .await
            .is_immediate()
    }

    /// Mark the session as cancelled, recording where execution stopped
    pub async fn mark_cancelled(
        &self,
        session_id: &str,
        project_path: &Path,
        cancelled_at_step: Option<&str>,
    ) -> RexResult<()> {
        self.update(session_id, project_path, |state| {
            state.cancellation_status = CancellationStatus::Cancelled;
            state.cancelled_at_step = cancelled_at_step.map(str::to_string);
            state.cancelled_at = Some(Utc::now());
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Reset a cancelled session back to runnable (resume path).
    ///
    /// Only valid on a cancelled session; requests in flight may not be
    /// silently discarded.
    pub async fn clear_cancellation(
        &self,
        session_id: &str,
        project_path: &Path,
    ) -> RexResult<()> {
        self.update(session_id, project_path, |state| {
            if state.cancellation_status != CancellationStatus::Cancelled {
                return Err(RexError::session(format!(
                    "Cannot clear cancellation in state {:?}",
                    state.cancellation_status
                )));
            }
            state.cancellation_status = CancellationStatus::None;
            state.cancelled_at_step = None;
            state.cancelled_at = None;
            Ok(())
        })
        .await?;
        Ok(())
    }
}
