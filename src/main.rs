//! Kiln - run compiled-language scripts
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use kiln::cli::args::ServerAction;
use kiln::cli::{Cli, Commands};
use kiln::config::ConfigManager;
use kiln::error::{KilnError, KilnResult};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr; stdout belongs to command output and the script.
/// A foreground server logs lifecycle events by default since its stderr
/// is the server log file.
fn init_logging(verbose: u8, serving: bool, json: bool) {
    let level = match (verbose, serving) {
        (0, false) => "warn",
        (0, true) | (1, _) => "info",
        _ => "debug",
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("kiln={}", level)))
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else if serving {
        builder.init();
    } else {
        builder.without_time().init();
    }
}

async fn run() -> KilnResult<ExitCode> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    let local_config_path = if cli.no_local {
        None
    } else {
        let cwd =
            std::env::current_dir().map_err(|e| KilnError::io("getting current directory", e))?;
        ConfigManager::find_local_config(&cwd)
    };

    let config = config_manager
        .load_merged(local_config_path.as_deref())
        .await?;

    let serving = matches!(
        cli.command,
        Commands::Server(ref args) if matches!(args.action, ServerAction::Listen { .. })
    );
    init_logging(cli.verbose, serving, config.general.log_format == "json");

    if cli.no_local {
        debug!("Local config discovery disabled (--no-local)");
    } else if let Some(ref path) = local_config_path {
        debug!("Using local config: {}", path.display());
    }

    ConfigManager::ensure_state_dirs().await?;

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run(args) => kiln::cli::commands::run(args, &config, config_path).await,
        Commands::Build(args) => kiln::cli::commands::build(args, &config, config_path)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Inspect(args) => kiln::cli::commands::inspect(args, &config)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Server(args) => kiln::cli::commands::server(args, &config, config_path)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Cache(args) => kiln::cli::commands::cache(args, &config)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Config(args) => kiln::cli::commands::config(args, &config, config_path)
            .await
            .map(|()| ExitCode::SUCCESS),
    }
}
