mod cli;
mod commands;
mod coordinator;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rex_runtime::RecipeExecutor;
use rex_session::SessionStore;

use cli::{Cli, Commands};
use commands::CommandContext;
use coordinator::CliCoordinator;

fn default_session_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rex")
        .join("projects")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let project_path = match &cli.project {
        Some(project) => PathBuf::from(project),
        None => std::env::current_dir().context("Failed to determine working directory")?,
    };
    let session_dir = cli
        .session_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(default_session_dir);

    tracing::debug!(
        "Using project {} with sessions under {}",
        project_path.display(),
        session_dir.display()
    );

    let coordinator = Arc::new(CliCoordinator::new());
    if matches!(&cli.command, Commands::Execute { .. } | Commands::Resume { .. }) {
        coordinator.install_signal_handler();
    }

    let store = Arc::new(SessionStore::new(session_dir));
    let executor = RecipeExecutor::new(coordinator, store.clone());
    let ctx = CommandContext {
        store,
        executor,
        project_path,
    };

    let payload = match &cli.command {
        Commands::Execute {
            recipe_path,
            context,
        } => commands::execute::run(&ctx, recipe_path, context.as_deref()).await,
        Commands::Resume { session_id } => commands::resume::run(&ctx, session_id).await,
        Commands::List => commands::sessions::list(&ctx).await,
        Commands::Validate { recipe_path } => commands::validate::run(recipe_path),
        Commands::Approvals => commands::approvals::list(&ctx).await,
        Commands::Approve {
            session_id,
            stage_name,
        } => commands::approvals::approve(&ctx, session_id, stage_name).await,
        Commands::Deny {
            session_id,
            stage_name,
            reason,
        } => commands::approvals::deny(&ctx, session_id, stage_name, reason.as_deref()).await,
        Commands::Cancel {
            session_id,
            immediate,
        } => commands::cancel::run(&ctx, session_id, *immediate).await,
    };

    println!("{}", serde_json::to_string_pretty(&payload)?);
    if !commands::is_success(&payload) {
        std::process::exit(1);
    }
    Ok(())
}
