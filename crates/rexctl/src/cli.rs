use clap::{Parser, Subcommand};

/// Rex CLI - execute and manage recipe workflow sessions
#[derive(Parser, Debug)]
#[command(name = "rexctl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Project directory sessions are scoped to
    #[arg(long, short = 'p', global = true, env = "REX_PROJECT")]
    pub project: Option<String>,

    /// Directory holding per-project session state
    #[arg(long, global = true, env = "REX_SESSION_DIR")]
    pub session_dir: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a recipe from a YAML file
    Execute {
        /// Path to the recipe file
        recipe_path: String,

        /// Context variables as a JSON object
        #[arg(short, long)]
        context: Option<String>,
    },

    /// Resume an interrupted session
    Resume {
        /// Session to resume
        session_id: String,
    },

    /// List sessions for the project
    List,

    /// Validate a recipe without executing it
    Validate {
        /// Path to the recipe file
        recipe_path: String,
    },

    /// List pending approvals across sessions
    Approvals,

    /// Approve a stage so the session can continue
    Approve {
        session_id: String,
        stage_name: String,
    },

    /// Deny a stage, stopping the session
    Deny {
        session_id: String,
        stage_name: String,

        /// Reason recorded with the denial
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Cancel a running session (graceful by default)
    Cancel {
        session_id: String,

        /// Stop at the next poll point instead of after the current step
        #[arg(long)]
        immediate: bool,
    },
}
