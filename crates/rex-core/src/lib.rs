// Rex Core - Foundation types for the Rex recipe workflow engine
//
// This crate provides the recipe data model, the execution context, and
// the pure machinery (templates, conditions, JSON recovery) that the
// runtime crate drives.

pub mod condition;
pub mod context;
pub mod error;
pub mod json_extract;
pub mod recipe;
pub mod summary;
pub mod template;
pub mod validate;

// Re-export core types
pub use condition::evaluate_condition;
pub use context::{Context, RESERVED_CONTEXT_KEYS, SKIPPED_STEPS_KEY};
pub use error::{RexError, RexResult};
pub use json_extract::{extract_json_aggressively, postprocess_output};
pub use recipe::{
    ApprovalConfig, ApprovalDefault, BackoffConfig, BackoffStrategy, OnError, OrchestratorConfig,
    Parallelism, RateLimitConfig, Recipe, RecursionConfig, RetryConfig, Stage, Step, StepKind,
};
pub use summary::{extract_result_summary, truncate_value, MAX_OUTPUT_SIZE_BYTES};
pub use template::{resolve_path, resolve_single_reference, substitute, substitute_value};
pub use validate::{ensure_valid, validate_recipe, Validation, RESERVED_OUTPUT_NAMES};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
