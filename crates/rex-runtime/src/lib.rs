// Rex Runtime - Recipe execution engine
//
// Drives recipes against a host-provided Coordinator: step scheduling,
// checkpoint/resume, foreach loops, sub-recipe composition, rate
// limiting, approval gates, and cooperative cancellation.

pub mod cancel;
pub mod coordinator;
mod dispatch;
pub mod executor;
mod foreach;
pub mod limiter;
pub mod recursion;

pub use cancel::ProcessCancellation;
pub use coordinator::{Coordinator, MessageLevel, SpawnOutput, SpawnRequest};
pub use executor::{RecipeExecutor, RunOutcome};
pub use limiter::{LimiterStats, RateLimiter};
pub use recursion::RecursionState;
