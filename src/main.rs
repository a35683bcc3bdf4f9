// src/main.rs

use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();
    let repo = cli.repo.as_path();

    match cli.command {
        Commands::Plan { args, json } => commands::cmd_plan(config, repo, &args, json),
        Commands::Select { list } => commands::cmd_select(config, repo, list),
        Commands::Build { args } => commands::cmd_build(config, repo, &args),
        Commands::Image { args, no_export } => commands::cmd_image(config, repo, &args, no_export),
        Commands::Run {
            args,
            no_export,
            json,
        } => commands::cmd_run(config, repo, &args, no_export, json),
    }
}
