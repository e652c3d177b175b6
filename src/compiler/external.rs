//! Command-line compiler backend

use crate::compiler::{output_tail, parse_diagnostics, CompileJob, Compiler, CompilerOutput};
use crate::config::schema::CompilerConfig;
use crate::diagnostic::{error_count, Diagnostic};
use crate::error::{KilnError, KilnResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, UNIX_EPOCH};
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs a configured compiler executable
///
/// The command line is assembled as
/// `program args mode_args unit_args [ref_flag] refs... output_flag artifact sources...`.
pub struct ExternalCompiler {
    config: CompilerConfig,
    program: Option<PathBuf>,
}

impl ExternalCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        let program = which::which(&config.program)
            .ok()
            .and_then(|p| p.canonicalize().ok());
        if program.is_none() {
            warn!("Compiler '{}' not found on PATH", config.program);
        }
        Self { config, program }
    }

    fn command_line(&self, job: &CompileJob) -> Vec<String> {
        let mode_args = if job.debug {
            &self.config.debug_args
        } else {
            &self.config.release_args
        };

        let mut args: Vec<String> = self.config.args.clone();
        args.extend(mode_args.iter().cloned());
        args.extend(job.args.iter().cloned());
        for reference in &job.references {
            if let Some(flag) = &self.config.reference_flag {
                args.push(flag.clone());
            }
            args.push(reference.display().to_string());
        }
        args.push(self.config.output_flag.clone());
        args.push(job.artifact.display().to_string());
        args.extend(job.sources.iter().map(|s| s.display().to_string()));
        args
    }

    fn failed(message: String, mut diagnostics: Vec<Diagnostic>, exit_code: Option<i32>) -> CompilerOutput {
        diagnostics.push(Diagnostic::error(message));
        CompilerOutput {
            success: false,
            exit_code,
            diagnostics,
        }
    }
}

#[async_trait]
impl Compiler for ExternalCompiler {
    fn identity(&self) -> String {
        let Some(program) = &self.program else {
            return self.config.program.clone();
        };
        let stamp = std::fs::metadata(program)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("{}@{}", program.display(), stamp)
    }

    async fn compile(&self, job: &CompileJob) -> KilnResult<CompilerOutput> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| KilnError::CompilerNotFound(self.config.program.clone()))?;
        let args = self.command_line(job);
        debug!("Executing: {} {:?}", program.display(), args);

        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KilnError::command_failed(program.display().to_string(), e))?;

        let waited = if self.config.timeout_secs > 0 {
            let limit = Duration::from_secs(self.config.timeout_secs);
            match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Compiler timed out after {}s", self.config.timeout_secs);
                    return Ok(Self::failed(
                        format!("compiler timed out after {}s", self.config.timeout_secs),
                        Vec::new(),
                        None,
                    ));
                }
            }
        } else {
            child.wait_with_output().await
        };
        let output = waited.map_err(|e| KilnError::command_failed(program.display().to_string(), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut diagnostics = parse_diagnostics(&stdout);
        diagnostics.extend(parse_diagnostics(&stderr));
        let exit_code = output.status.code();

        if exit_code.is_none() {
            return Ok(Self::failed(
                format!(
                    "compiler terminated by signal\n{}",
                    output_tail(&stdout, &stderr)
                ),
                diagnostics,
                None,
            ));
        }

        if !output.status.success() {
            if error_count(&diagnostics) == 0 {
                let tail = output_tail(&stdout, &stderr);
                return Ok(Self::failed(
                    format!("compiler exited with code {}\n{}", exit_code.unwrap_or(-1), tail),
                    diagnostics,
                    exit_code,
                ));
            }
            return Ok(CompilerOutput {
                success: false,
                exit_code,
                diagnostics,
            });
        }

        if !job.artifact.is_file() {
            return Ok(Self::failed(
                format!(
                    "compiler succeeded but produced no artifact at {}",
                    job.artifact.display()
                ),
                diagnostics,
                exit_code,
            ));
        }

        Ok(CompilerOutput {
            success: true,
            exit_code,
            diagnostics,
        })
    }
}
