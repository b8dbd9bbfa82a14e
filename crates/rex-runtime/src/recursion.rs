// Rex Runtime - Recursion tracking across nested recipes
//
// Depth, per-branch limits, and the recipe-name stack are plain values
// cloned into each child. The cumulative agent-step counter is shared
// through an atomic so increments in a child (or a parallel branch) are
// visible everywhere without a copy-back. Bash and recipe steps do not
// count; parallel fan-out reserves all its slots in one check-and-add.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rex_core::{RecursionConfig, RexError, RexResult};

/// Recursion state for one recipe in the execution tree
#[derive(Debug, Clone)]
pub struct RecursionState {
    depth: u32,
    max_depth: u32,
    max_total_steps: usize,
    /// Recipe names from the root down, for diagnostics
    stack: Vec<String>,
    /// Cumulative agent-step counter, shared across the whole tree
    total_steps: Arc<AtomicUsize>,
}

impl RecursionState {
    /// State for a top-level recipe
    pub fn root(recipe_name: &str, config: RecursionConfig) -> Self {
        Self {
            depth: 0,
            max_depth: config.max_depth,
            max_total_steps: config.max_total_steps,
            stack: vec![recipe_name.to_string()],
            total_steps: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Child state for a sub-recipe.
    ///
    /// A per-step override replaces the limits for the subtree; the
    /// cumulative counter is always shared.
    pub fn enter_recipe(&self, recipe_name: &str, override_config: Option<RecursionConfig>) -> Self {
        let (max_depth, max_total_steps) = match override_config {
            Some(config) => (config.max_depth, config.max_total_steps),
            None => (self.max_depth, self.max_total_steps),
        };
        let mut stack = self.stack.clone();
        stack.push(recipe_name.to_string());
        Self {
            depth: self.depth + 1,
            max_depth,
            max_total_steps,
            stack,
            total_steps: Arc::clone(&self.total_steps),
        }
    }

    /// Fail if this state sits at or past the depth limit.
    ///
    /// Called on the child before its first step runs, so the limit
    /// triggers at the attempt to enter a level, not while running the
    /// level above it.
    pub fn check_depth(&self) -> RexResult<()> {
        if self.depth >= self.max_depth {
            return Err(RexError::recursion(format!(
                "Recipe recursion depth {} exceeds limit {}. Stack: {}",
                self.depth,
                self.max_depth,
                self.stack_trace()
            )));
        }
        Ok(())
    }

    /// Count one agent step against the shared budget
    pub fn increment_steps(&self) -> RexResult<()> {
        let total = self.total_steps.fetch_add(1, Ordering::SeqCst) + 1;
        if total >= self.max_total_steps {
            return Err(RexError::recursion(format!(
                "Total steps {} exceeds limit {}",
                total, self.max_total_steps
            )));
        }
        Ok(())
    }

    /// Reserve `n` agent steps at once for a parallel fan-out
    pub fn reserve(&self, n: usize) -> RexResult<()> {
        let mut current = self.total_steps.load(Ordering::SeqCst);
        loop {
            if current + n > self.max_total_steps {
                return Err(RexError::recursion(format!(
                    "Parallel loop would exceed max_total_steps ({} + {} > {})",
                    current, n, self.max_total_steps
                )));
            }
            match self.total_steps.compare_exchange(
                current,
                current + n,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps.load(Ordering::SeqCst)
    }

    /// The recipe stack as "a -> b -> c"
    pub fn stack_trace(&self) -> String {
        self.stack.join(" -> ")
    }
}
