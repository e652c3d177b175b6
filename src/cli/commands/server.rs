//! Server command - start, stop and list build servers

use crate::cli::args::{OutputFormat, ServerAction, ServerArgs};
use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use crate::server::{ServerControl, ServerInstance, StartOutcome, StopOutcome};
use crate::ui::{self, TaskSpinner, UiContext};
use console::style;
use std::path::Path;

/// Execute the server command
pub async fn execute(args: ServerArgs, config: &Config, config_path: Option<&Path>) -> KilnResult<()> {
    let ctx = UiContext::detect();
    let control = ServerControl::new(config.clone(), config_path.map(Path::to_path_buf));

    match args.action {
        ServerAction::Start { port } => start(&ctx, &control, control.port(port)).await,
        ServerAction::Stop { port } => stop(&ctx, &control, control.port(port)).await,
        ServerAction::Restart { port } => {
            let port = control.port(port);
            let mut spinner = TaskSpinner::new(&ctx);
            spinner.start(&format!("Restarting build server on port {}...", port));
            let outcome = control.restart(port).await?;
            spinner.stop(&format!(
                "Build server running on port {} (pid {})",
                port,
                outcome.pong().pid
            ));
            Ok(())
        }
        ServerAction::Ping { port } => ping(&ctx, &control, control.port(port)).await,
        ServerAction::Listen { port } => {
            let port = control.port(port);
            match control.listen(port).await? {
                StartOutcome::AlreadyRunning(pong) => {
                    ui::step_info(
                        &ctx,
                        &format!("Build server already running on port {} (pid {})", port, pong.pid),
                    );
                }
                StartOutcome::Started(_) => {}
            }
            Ok(())
        }
        ServerAction::List { format } => list(&ctx, &control, format).await,
        ServerAction::Kill => {
            let stopped = control.kill_all().await?;
            ui::step_ok(&ctx, &format!("Stopped {} build server(s)", stopped));
            Ok(())
        }
    }
}

async fn start(ctx: &UiContext, control: &ServerControl, port: u16) -> KilnResult<()> {
    let mut spinner = TaskSpinner::new(ctx);
    spinner.start(&format!("Starting build server on port {}...", port));

    match control.start(port).await {
        Ok(StartOutcome::Started(pong)) => {
            spinner.stop(&format!("Build server started on port {} (pid {})", port, pong.pid));
            Ok(())
        }
        Ok(StartOutcome::AlreadyRunning(pong)) => {
            spinner.stop(&format!(
                "Build server already running on port {} (pid {})",
                port, pong.pid
            ));
            Ok(())
        }
        Err(e) => {
            spinner.stop_error("Build server failed to start");
            Err(e)
        }
    }
}

async fn stop(ctx: &UiContext, control: &ServerControl, port: u16) -> KilnResult<()> {
    match control.stop(port).await? {
        StopOutcome::NotRunning => {
            ui::step_info(ctx, &format!("No build server on port {}", port))
        }
        StopOutcome::Stopped => ui::step_ok(ctx, &format!("Build server on port {} stopped", port)),
        StopOutcome::Killed => ui::step_warn_hint(
            ctx,
            &format!("Build server on port {} killed", port),
            "it did not respond to the stop request",
        ),
    }
    Ok(())
}

async fn ping(ctx: &UiContext, control: &ServerControl, port: u16) -> KilnResult<()> {
    let pong = control.ping(port).await.ok_or_else(|| KilnError::ServerTransport {
        port,
        reason: "not running".to_string(),
    })?;

    ui::step_ok(ctx, &format!("Build server on port {} is listening", port));
    ui::key_value(ctx, "PID", &pong.pid.to_string());
    ui::key_value(ctx, "Version", &pong.version);
    ui::key_value(ctx, "Started", &pong.started_at.format("%Y-%m-%d %H:%M:%S").to_string());
    Ok(())
}

async fn list(ctx: &UiContext, control: &ServerControl, format: OutputFormat) -> KilnResult<()> {
    let servers = control.list().await?;

    if servers.is_empty() {
        match format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => ui::step_info(ctx, "No build servers running"),
        }
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_table(&servers),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&servers)?),
        OutputFormat::Plain => {
            for server in &servers {
                println!("{}", server.port);
            }
        }
    }
    Ok(())
}

fn print_table(servers: &[ServerInstance]) {
    println!(
        "{:<8} {:<10} {:<18} {:<10} {:<20}",
        style("PORT").bold(),
        style("PID").bold(),
        style("STARTED").bold(),
        style("IDLE").bold(),
        style("COMPILER").bold()
    );
    println!("{}", "-".repeat(70));

    for server in servers {
        let idle = match server.idle_timeout_secs {
            0 => "never".to_string(),
            secs => format!("{}s", secs),
        };
        println!(
            "{:<8} {:<10} {:<18} {:<10} {:<20}",
            server.port,
            server.pid,
            server.started_at.format("%Y-%m-%d %H:%M").to_string(),
            idle,
            server.compiler
        );
    }

    println!();
    println!("{} server(s)", servers.len());
}
