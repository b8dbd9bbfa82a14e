// Rex Session - Durable per-session state
//
// One directory per project, one directory per session. The store owns
// every on-disk mutation; the engine and the outer tool go through it.

pub mod state;
pub mod store;

pub use state::{
    ApprovalStatus, CancellationStatus, PendingApproval, SessionState, SessionSummary,
    StageApproval,
};
pub use store::SessionStore;
