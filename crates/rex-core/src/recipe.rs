// Rex Core - Recipe data model and YAML loading
//
// A recipe is a declarative multi-step agent workflow. It is either flat
// (a list of steps) or staged (named stages with optional approval gates);
// never both. Structural rules live in validate.rs.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{RexError, RexResult};

/// Recursion protection for recipe composition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecursionConfig {
    /// Maximum nesting depth for sub-recipes (1-20)
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Cumulative agent-step budget across the whole recipe tree (1-1000)
    #[serde(default = "default_max_total_steps")]
    pub max_total_steps: usize,
}

fn default_max_depth() -> u32 {
    5
}

fn default_max_total_steps() -> usize {
    100
}

impl Default for RecursionConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_total_steps: default_max_total_steps(),
        }
    }
}

/// Adaptive back-off applied after rate-limit hits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    /// Auto-slow on 429 errors
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Starting delay after the first rate-limit hit
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_delay_ms: u64,

    /// Delay cap
    #[serde(default = "default_backoff_max_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied per consecutive hit
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    /// Clear the delay after this many consecutive successes
    #[serde(default = "default_reset_after_success")]
    pub reset_after_success: u32,
}

fn default_true() -> bool {
    true
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_reset_after_success() -> u32 {
    3
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: default_backoff_initial_ms(),
            max_delay_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
            reset_after_success: default_reset_after_success(),
        }
    }
}

/// Rate limiting for LLM calls across the entire recipe tree.
///
/// Sub-recipes inherit the parent's limits and cannot override them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Max concurrent LLM calls (None = unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_llm: Option<usize>,

    /// Minimum delay between LLM call completions
    #[serde(default)]
    pub min_delay_ms: u64,

    /// Back-off behavior on rate-limit errors
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Pass-through configuration for spawned agent sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Opaque settings forwarded to the spawner
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// What happens when an approval gate times out
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDefault {
    #[default]
    Deny,
    Approve,
}

/// Approval gate configuration for a stage
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApprovalConfig {
    /// Whether approval is needed to proceed past this stage
    #[serde(default)]
    pub required: bool,

    /// Message shown to the user when requesting approval
    #[serde(default)]
    pub prompt: String,

    /// Seconds to wait for approval (0 = wait forever)
    #[serde(default)]
    pub timeout: u64,

    /// Decision applied when the timeout elapses
    #[serde(default)]
    pub default: ApprovalDefault,
}

/// Step kind - agent, sub-recipe, or shell command
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Spawn an LLM agent with a prompt
    #[default]
    Agent,
    /// Execute a sub-recipe
    Recipe,
    /// Execute a shell command directly (no LLM overhead)
    Bash,
}

/// Retry back-off strategy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
}

/// Retry policy for agent steps
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Seconds to sleep before the second attempt
    #[serde(default = "default_retry_initial_delay")]
    pub initial_delay: u64,

    /// Cap on the sleep between attempts, in seconds
    #[serde(default = "default_retry_max_delay")]
    pub max_delay: u64,

    /// Growth of the sleep across attempts
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retry_initial_delay() -> u64 {
    5
}

fn default_retry_max_delay() -> u64 {
    300
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_retry_initial_delay(),
            max_delay: default_retry_max_delay(),
            backoff: BackoffStrategy::Exponential,
        }
    }
}

/// Failure policy applied after the last retry attempt
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Re-raise the failure
    #[default]
    Fail,
    /// Store a null result and move to the next step
    Continue,
    /// End the enclosing step loop without failing the recipe
    SkipRemaining,
}

/// Foreach parallelism: off, unbounded, or a concurrency cap.
///
/// YAML accepts `false`, `true`, or a positive integer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Parallelism {
    #[default]
    Off,
    Unbounded,
    Bounded(usize),
}

impl Parallelism {
    pub fn is_parallel(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

impl Serialize for Parallelism {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Off => serializer.serialize_bool(false),
            Self::Unbounded => serializer.serialize_bool(true),
            Self::Bounded(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

impl<'de> Deserialize<'de> for Parallelism {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Bool(false) => Ok(Self::Off),
            serde_json::Value::Bool(true) => Ok(Self::Unbounded),
            serde_json::Value::Number(n) => {
                let n = n
                    .as_u64()
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| de::Error::custom("parallel must be a positive integer"))?;
                Ok(Self::Bounded(n as usize))
            }
            other => Err(de::Error::custom(format!(
                "parallel must be true, false, or a positive integer, got {other}"
            ))),
        }
    }
}

/// A single unit of work in a recipe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step identifier, unique across the recipe
    pub id: String,

    /// Step kind (agent, recipe, or bash)
    #[serde(rename = "type", default)]
    pub kind: StepKind,

    // Agent step fields
    /// Agent to spawn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    /// Prompt template (supports {{variable}} substitution)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Optional mode line prepended to the prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// Opaque per-agent configuration forwarded to the spawner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_config: Option<serde_json::Map<String, serde_json::Value>>,

    // Recipe step fields
    /// Path or @mention of the sub-recipe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe: Option<String>,

    /// Context passed to the sub-recipe (sole input, templates resolved
    /// against the parent context)
    #[serde(default, rename = "context", skip_serializing_if = "Option::is_none")]
    pub step_context: Option<serde_json::Map<String, serde_json::Value>>,

    /// Per-step recursion override (recipe steps only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recursion: Option<RecursionConfig>,

    // Bash step fields
    /// Shell command (supports {{variable}} substitution)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Working directory, absolute or project-relative
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Environment overlay; values support {{variable}} substitution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,

    /// Context key receiving the decimal exit code string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_exit_code: Option<String>,

    // Common fields
    /// Context key receiving the step result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Guard condition; the step is skipped when it evaluates false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Collection reference to iterate over, e.g. "{{items}}"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<String>,

    /// Loop variable name (defaults to "item")
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_var: Option<String>,

    /// Context key receiving the list of per-iteration results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect: Option<String>,

    /// Foreach parallelism
    #[serde(default)]
    pub parallel: Parallelism,

    /// Upper bound on foreach iterations
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Step timeout in seconds (enforced for bash steps)
    #[serde(default = "default_step_timeout")]
    pub timeout: u64,

    /// Retry policy (agent steps)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    /// Failure policy after the last attempt
    #[serde(default)]
    pub on_error: OnError,

    /// Declared ordering dependencies; validated, never reordered
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Opt in to aggressive JSON extraction of the step output
    #[serde(default)]
    pub parse_json: bool,
}

fn default_max_iterations() -> usize {
    100
}

fn default_step_timeout() -> u64 {
    600
}

/// A named sub-sequence of steps with an optional approval gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name, unique within the recipe
    pub name: String,

    /// Steps executed in declared order
    pub steps: Vec<Step>,

    /// Approval gate crossed after the stage completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalConfig>,
}

/// A complete recipe specification.
///
/// Exactly one of `steps` (flat mode) or `stages` (staged mode with
/// approval gates) is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    /// Recipe name (alphanumeric plus hyphens/underscores)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Semver MAJOR.MINOR.PATCH
    #[serde(default)]
    pub version: String,

    /// Flat mode steps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,

    /// Staged mode stages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,

    /// Descriptive metadata (ignored by the engine)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Initial context map merged under the caller's context
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,

    /// Recipe-level recursion limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recursion: Option<RecursionConfig>,

    /// Recipe-level rate limiting (root recipe only; inherited by
    /// sub-recipes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limiting: Option<RateLimitConfig>,

    /// Orchestrator settings forwarded to spawned sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<OrchestratorConfig>,
}

impl Recipe {
    /// True when the recipe uses staged mode with approval gates
    pub fn is_staged(&self) -> bool {
        !self.stages.is_empty()
    }

    /// All steps from either mode, in execution order
    pub fn all_steps(&self) -> Vec<&Step> {
        if self.is_staged() {
            self.stages.iter().flat_map(|s| s.steps.iter()).collect()
        } else {
            self.steps.iter().collect()
        }
    }

    /// Look up a step by id across both modes
    pub fn get_step(&self, step_id: &str) -> Option<&Step> {
        self.all_steps().into_iter().find(|s| s.id == step_id)
    }

    /// Look up a stage by name (staged mode only)
    pub fn get_stage(&self, stage_name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == stage_name)
    }

    /// Output key declared by the last step, if any.
    ///
    /// Used by the result summary when the recipe does not set an
    /// explicit `final_output` context key.
    pub fn last_output_key(&self) -> Option<&str> {
        let last = if self.is_staged() {
            self.stages.last().and_then(|s| s.steps.last())
        } else {
            self.steps.last()
        };
        last.and_then(|s| s.output.as_deref())
    }

    /// Parse a recipe from YAML text with field-precise errors
    pub fn from_yaml_str(content: &str) -> RexResult<Self> {
        let deserializer = serde_yaml::Deserializer::from_str(content);
        let recipe: Recipe = serde_path_to_error::deserialize(deserializer).map_err(|e| {
            let path = e.path().to_string();
            if path.is_empty() || path == "." {
                RexError::config(format!("Failed to parse recipe: {}", e.inner()))
            } else {
                RexError::config(format!(
                    "Failed to parse recipe at '{}': {}",
                    path,
                    e.inner()
                ))
            }
        })?;

        if !recipe.steps.is_empty() && !recipe.stages.is_empty() {
            return Err(RexError::config(
                "Recipe cannot have both 'stages' and 'steps' - use one or the other",
            ));
        }

        Ok(recipe)
    }

    /// Load a recipe from a YAML file
    pub fn from_yaml_file(path: &Path) -> RexResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RexError::config(format!("Failed to read recipe {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
            .map_err(|e| RexError::config(format!("{}: {}", path.display(), e)))
    }
}
