//! Run command - build a script if needed and execute it

use super::build::{build_script, into_artifact};
use crate::cli::args::RunArgs;
use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use crate::ui::UiContext;
use std::path::Path;
use std::process::{ExitCode, ExitStatus};
use tokio::process::Command;
use tracing::debug;

/// Execute the run command, returning the script's exit code
pub async fn execute(args: RunArgs, config: &Config, config_path: Option<&Path>) -> KilnResult<ExitCode> {
    let ctx = UiContext::detect();
    let result = build_script(&ctx, &args.build, config, config_path).await?;
    let artifact = into_artifact(&ctx, result)?;

    let mut command = script_command(&artifact, &config.compiler.runner, &args.args);
    debug!("Executing {:?}", command.as_std());

    let status = command
        .status()
        .await
        .map_err(|e| KilnError::command_failed(artifact.display().to_string(), e))?;
    Ok(ExitCode::from(exit_code(status)))
}

/// The artifact invocation, behind the runner prefix when one is configured
fn script_command(artifact: &Path, runner: &[String], args: &[String]) -> Command {
    let mut command = match runner.split_first() {
        Some((program, prefix)) => {
            let mut command = Command::new(program);
            command.args(prefix).arg(artifact);
            command
        }
        None => Command::new(artifact),
    };
    command.args(args);
    command
}

/// Map the child's status to our own, shell style for signals
fn exit_code(status: ExitStatus) -> u8 {
    if let Some(code) = status.code() {
        return u8::try_from(code & 0xff).unwrap_or(1);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return u8::try_from(128 + signal).unwrap_or(1);
        }
    }
    1
}
