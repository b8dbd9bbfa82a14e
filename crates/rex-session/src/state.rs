// Rex Session - Persisted state documents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use rex_core::{ApprovalDefault, Context};

/// Outcome of an approval gate decision
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Waiting for a decision
    Pending,
    /// Approved, explicitly or by timeout default
    Approved,
    /// Denied explicitly
    Denied,
    /// Timed out with default=deny
    Timeout,
}

/// Per-session cancellation state.
///
/// Transitions are monotonic: none -> requested -> immediate -> cancelled.
/// Only a cancelled session may be cleared back to none (on resume).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CancellationStatus {
    #[default]
    None,
    /// Graceful: the in-flight step completes, then execution stops
    Requested,
    /// Stop at the next poll point
    Immediate,
    /// Execution has stopped; the session can be resumed
    Cancelled,
}

impl CancellationStatus {
    pub fn is_requested(&self) -> bool {
        matches!(self, Self::Requested | Self::Immediate)
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate)
    }
}

/// An approval request waiting on a human decision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingApproval {
    pub stage_name: String,
    pub prompt: String,
    /// Seconds to wait (0 = wait forever)
    pub timeout: u64,
    /// Decision applied when the timeout elapses
    pub default: ApprovalDefault,
    pub requested_at: DateTime<Utc>,
}

/// A recorded approval decision for one stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageApproval {
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// The durable state document for one session.
///
/// Flat and staged recipes share the document; staged-only fields default
/// to empty so older flat documents load unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub recipe_name: String,
    pub recipe_version: String,
    pub started: DateTime<Utc>,
    pub project_path: String,

    /// Next step to execute (flat mode)
    #[serde(default)]
    pub current_step_index: usize,

    /// Accumulated execution context
    #[serde(default)]
    pub context: Context,

    /// Ids of completed steps, in completion order
    #[serde(default)]
    pub completed_steps: Vec<String>,

    // Staged mode
    #[serde(default)]
    pub is_staged: bool,

    #[serde(default)]
    pub current_stage_index: usize,

    /// Next step to execute within the current stage
    #[serde(default)]
    pub current_step_in_stage: usize,

    #[serde(default)]
    pub completed_stages: Vec<String>,

    /// Approval request currently blocking the session, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,

    /// Recorded decisions keyed by stage name
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub stage_approvals: HashMap<String, StageApproval>,

    // Cancellation
    #[serde(default)]
    pub cancellation_status: CancellationStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at_step: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Initial state for a freshly created session
    pub fn new(
        session_id: String,
        recipe_name: String,
        recipe_version: String,
        is_staged: bool,
        project_path: String,
    ) -> Self {
        Self {
            session_id,
            recipe_name,
            recipe_version,
            started: Utc::now(),
            project_path,
            current_step_index: 0,
            context: Context::new(),
            completed_steps: Vec::new(),
            is_staged,
            current_stage_index: 0,
            current_step_in_stage: 0,
            completed_stages: Vec::new(),
            pending_approval: None,
            stage_approvals: HashMap::new(),
            cancellation_status: CancellationStatus::None,
            cancelled_at_step: None,
            cancelled_at: None,
        }
    }
}

/// Compact session listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub recipe_name: String,
    pub recipe_version: String,
    pub started: DateTime<Utc>,
    pub is_staged: bool,
    pub completed_steps: usize,
    pub cancellation_status: CancellationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<String>,
}

impl From<&SessionState> for SessionSummary {
    fn from(state: &SessionState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            recipe_name: state.recipe_name.clone(),
            recipe_version: state.recipe_version.clone(),
            started: state.started,
            is_staged: state.is_staged,
            completed_steps: state.completed_steps.len(),
            cancellation_status: state.cancellation_status,
            pending_approval: state
                .pending_approval
                .as_ref()
                .map(|p| p.stage_name.clone()),
        }
    }
}
