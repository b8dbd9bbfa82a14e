// CLI coordinator: SIGINT wiring and terminal output.
//
// The CLI hosts no agent spawner; bash and sub-recipe steps run fully,
// while agent steps report the missing capability. Embedding hosts
// provide a real spawner through the same trait.

use async_trait::async_trait;
use std::path::PathBuf;

use rex_core::{RexError, RexResult};
use rex_runtime::{Coordinator, MessageLevel, ProcessCancellation, SpawnOutput, SpawnRequest};

pub struct CliCoordinator {
    cancellation: ProcessCancellation,
}

impl CliCoordinator {
    pub fn new() -> Self {
        Self {
            cancellation: ProcessCancellation::new(),
        }
    }

    /// Wire SIGINT: first ^C requests graceful cancellation, a second
    /// escalates to immediate.
    pub fn install_signal_handler(&self) {
        let cancellation = self.cancellation.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if cancellation.is_requested() {
                    eprintln!("Immediate cancellation requested");
                } else {
                    eprintln!("Graceful cancellation requested; current step will complete (^C again for immediate)");
                }
                cancellation.request();
            }
        });
    }
}

impl Default for CliCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for CliCoordinator {
    async fn spawn(&self, request: SpawnRequest) -> RexResult<SpawnOutput> {
        Err(RexError::capability(format!(
            "Agent '{}' requires agent spawning but 'session.spawn' capability is not registered. \
             Run this recipe from a host that provides an agent spawner.",
            request.agent_name
        )))
    }

    fn resolve_mention(&self, _mention: &str) -> Option<PathBuf> {
        None
    }

    fn cancellation_requested(&self) -> bool {
        self.cancellation.is_requested()
    }

    fn cancellation_immediate(&self) -> bool {
        self.cancellation.is_immediate()
    }

    fn show_message(&self, message: &str, level: MessageLevel) {
        match level {
            MessageLevel::Info => eprintln!("{message}"),
            MessageLevel::Warning => eprintln!("warning: {message}"),
            MessageLevel::Error => eprintln!("error: {message}"),
        }
    }
}
