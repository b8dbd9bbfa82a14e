// Rex Runtime - Cooperative cancellation
//
// Two signal sources feed one per-session flag: the host's process-wide
// signal (typically SIGINT) and the outer cancel operation writing to the
// session store. Executors poll at documented points; nothing is ever
// torn down mid-step. The per-session flag is durable, so a crashed
// engine restarts in the cancelled state until resume clears it.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rex_core::{RexError, RexResult};
use rex_session::SessionStore;

use crate::coordinator::Coordinator;

/// Process-wide cancellation signal for hosts to wire to SIGINT.
///
/// The first request is graceful; a second request (or an explicitly
/// immediate one) escalates.
#[derive(Debug, Clone, Default)]
pub struct ProcessCancellation {
    requested: Arc<AtomicBool>,
    immediate: Arc<AtomicBool>,
}

impl ProcessCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cancellation request, escalating on repeat
    pub fn request(&self) {
        if self.requested.swap(true, Ordering::SeqCst) {
            self.immediate.store(true, Ordering::SeqCst);
        }
    }

    /// Record an immediate cancellation request
    pub fn request_immediate(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.immediate.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate.load(Ordering::SeqCst)
    }
}

/// Poll both cancellation sources for a session.
///
/// A set process-wide flag is forwarded into the store with matching
/// immediacy, then the per-session flag decides. Returns
/// `RexError::Cancelled` when the session should stop at this point.
pub(crate) async fn poll_cancellation(
    coordinator: &dyn Coordinator,
    store: &SessionStore,
    session_id: &str,
    project_path: &Path,
) -> RexResult<()> {
    if coordinator.cancellation_requested() {
        let immediate = coordinator.cancellation_immediate();
        // Already-cancelled sessions reject further requests; that is fine
        let _ = store
            .request_cancellation(session_id, project_path, immediate)
            .await;
    }

    let status = store.get_cancellation_status(session_id, project_path).await;
    if status.is_requested() {
        return Err(RexError::Cancelled {
            session_id: session_id.to_string(),
            immediate: status.is_immediate(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_request_is_graceful_second_escalates() {
        let signal = ProcessCancellation::new();
        assert!(!signal.is_requested());

        signal.request();
        assert!(signal.is_requested());
        assert!(!signal.is_immediate());

        signal.request();
        assert!(signal.is_immediate());
    }

    #[test]
    fn explicit_immediate_request() {
        let signal = ProcessCancellation::new();
        signal.request_immediate();
        assert!(signal.is_requested());
        assert!(signal.is_immediate());
    }
}
