// Rex Core - Error types
//
// Control-flow signals (skip-remaining, approval pause, cancellation) are
// dedicated variants rather than stringly-typed errors so that executors
// and callers can pattern-match on them.

use thiserror::Error;

/// Result type alias for Rex operations
pub type RexResult<T> = Result<T, RexError>;

/// Errors produced by the recipe engine
#[derive(Error, Debug)]
pub enum RexError {
    /// Recipe failed structural validation before execution
    #[error("Validation error: {0}")]
    Validation(String),

    /// Recipe file could not be loaded or parsed
    #[error("Config error: {0}")]
    Config(String),

    /// Template substitution failed (undefined variable, bad dotted access)
    #[error("Template error: {0}")]
    Template(String),

    /// Boolean condition expression failed to parse or evaluate
    #[error("Condition error: {0}")]
    Condition(String),

    /// A step failed after exhausting its retry policy
    #[error("Step '{step}' failed: {message}")]
    Step { step: String, message: String },

    /// Recursion depth or cumulative step limit exceeded
    #[error("Recursion error: {0}")]
    Recursion(String),

    /// Session store I/O or state document failure
    #[error("Session error: {0}")]
    Session(String),

    /// A required coordinator capability is missing
    #[error("Capability error: {0}")]
    Capability(String),

    /// Signal: a step with on_error=skip_remaining failed; the enclosing
    /// step loop ends without failing the recipe
    #[error("Remaining steps skipped")]
    SkipRemaining,

    /// Signal: execution paused at an approval gate awaiting a decision
    #[error("Execution paused at stage '{stage_name}' awaiting approval")]
    ApprovalPaused {
        session_id: String,
        stage_name: String,
        prompt: String,
    },

    /// A stage approval was denied
    #[error("Execution denied at stage '{stage_name}': {reason}")]
    ApprovalDenied { stage_name: String, reason: String },

    /// A stage approval timed out with default=deny
    #[error("Approval for stage '{stage_name}' timed out and was denied")]
    ApprovalTimeout { stage_name: String },

    /// Signal: cancellation was requested for the session
    #[error("Execution cancelled for session '{session_id}'")]
    Cancelled { session_id: String, immediate: bool },
}

impl RexError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a template error
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a condition error
    pub fn condition(msg: impl Into<String>) -> Self {
        Self::Condition(msg.into())
    }

    /// Create a step error
    pub fn step(step: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            message: msg.into(),
        }
    }

    /// Create a recursion error
    pub fn recursion(msg: impl Into<String>) -> Self {
        Self::Recursion(msg.into())
    }

    /// Create a session error
    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    /// Create a capability error
    pub fn capability(msg: impl Into<String>) -> Self {
        Self::Capability(msg.into())
    }

    /// Heuristic rate-limit classification on the rendered error.
    ///
    /// Spawners surface provider throttling in free text; a richer
    /// taxonomy would replace this substring match.
    pub fn is_rate_limit(&self) -> bool {
        let rendered = self.to_string().to_lowercase();
        rendered.contains("429") || rendered.contains("rate limit")
    }

    /// True for variants that signal control flow rather than failure
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            Self::SkipRemaining | Self::ApprovalPaused { .. } | Self::Cancelled { .. }
        )
    }
}
