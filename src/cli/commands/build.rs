//! Build command - compile a script and print the artifact path
//!
//! Also hosts the request plumbing `run` shares: builds go to the build
//! server when enabled, starting one if allowed, and fall back to an
//! in-process build when no server can be reached.

use crate::build::{BuildRequest, BuildResult, BuildService, FailureKind};
use crate::cli::args::BuildArgs;
use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use crate::server::{Client, ServerControl};
use crate::ui::{self, TaskSpinner, UiContext};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config, config_path: Option<&Path>) -> KilnResult<()> {
    let ctx = UiContext::detect();
    let result = build_script(&ctx, &args, config, config_path).await?;
    let artifact = into_artifact(&ctx, result)?;
    println!("{}", artifact.display());
    Ok(())
}

/// Build the script named by `args`, reporting progress on stderr
pub(crate) async fn build_script(
    ctx: &UiContext,
    args: &BuildArgs,
    config: &Config,
    config_path: Option<&Path>,
) -> KilnResult<BuildResult> {
    let request = build_request(args)?;
    let name = request
        .script
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| request.script.display().to_string());

    let mut spinner = TaskSpinner::new(ctx).quiet();
    spinner.start(&format!("Building {}...", name));

    let result = if config.server.enabled && !args.no_server {
        let control = ServerControl::new(config.clone(), config_path.map(Path::to_path_buf));
        let port = control.port(args.port);
        match build_on_server(&control, port, &request, config.server.auto_start).await {
            Ok(result) => result,
            Err(e) if is_unreachable(&e) => {
                warn!("Building in-process, server unavailable: {}", e);
                BuildService::from_config(config).build(&request).await
            }
            Err(e) => {
                spinner.stop_error(&format!("Build of {} failed", name));
                return Err(e);
            }
        }
    } else {
        debug!("Building {} in-process", request.script.display());
        BuildService::from_config(config).build(&request).await
    };

    if result.success {
        let how = if result.cached { "cached" } else { "compiled" };
        spinner.stop(&format!("Built {} ({})", name, how));
    } else {
        spinner.stop_error(&format!("Build of {} failed", name));
    }
    Ok(result)
}

/// Print diagnostics and turn a failed result into an error
pub(crate) fn into_artifact(ctx: &UiContext, result: BuildResult) -> KilnResult<PathBuf> {
    ui::diagnostics(ctx, &result.diagnostics);

    match (result.success, result.artifact) {
        (true, Some(artifact)) => Ok(artifact),
        (true, None) => Err(KilnError::Internal(
            "build succeeded without an artifact".to_string(),
        )),
        (false, _) => Err(match result.failure {
            Some(FailureKind::Compile) => KilnError::Compile {
                errors: crate::diagnostic::error_count(&result.diagnostics),
            },
            Some(kind) => KilnError::User(format!("Build failed ({} error)", kind)),
            None => KilnError::User("Build failed".to_string()),
        }),
    }
}

/// Turn CLI flags into a request with absolute paths.
///
/// The server may run in a different directory, so nothing relative to the
/// current directory may cross the wire.
fn build_request(args: &BuildArgs) -> KilnResult<BuildRequest> {
    let cwd = std::env::current_dir().map_err(|e| KilnError::io("getting current directory", e))?;

    let script = std::fs::canonicalize(&args.script)
        .map_err(|_| KilnError::ScriptNotFound(args.script.clone()))?;
    if !script.is_file() {
        return Err(KilnError::ScriptNotFound(args.script.clone()));
    }

    // References that name an existing path are taken from the cwd; bare
    // names go through the resolver's search
    let references = args
        .references
        .iter()
        .map(|reference| {
            let candidate = cwd.join(reference);
            if candidate.is_file() {
                candidate.display().to_string()
            } else {
                reference.clone()
            }
        })
        .collect();

    Ok(BuildRequest {
        script,
        debug: args.debug,
        references,
        args: args.compiler_args.clone(),
        force: args.force,
        output: args.output.as_ref().map(|output| cwd.join(output)),
    })
}

/// Send the build to the server on `port`, starting it first if allowed
async fn build_on_server(
    control: &ServerControl,
    port: u16,
    request: &BuildRequest,
    auto_start: bool,
) -> KilnResult<BuildResult> {
    let client = Client::new(port);
    match client.build(request).await {
        Err(KilnError::ServerTransport { reason, .. }) if auto_start => {
            debug!("No server on port {} ({}), starting one", port, reason);
            control.start(port).await?;
            client.build(request).await
        }
        other => other,
    }
}

/// Errors after which an in-process build is still worth trying
fn is_unreachable(error: &KilnError) -> bool {
    matches!(
        error,
        KilnError::ServerTransport { .. }
            | KilnError::ServerStartTimeout { .. }
            | KilnError::ServerProtocol(_)
    )
}
