//! Compiler backends
//!
//! The compiler is opaque to the rest of kiln: it receives ordered source
//! paths, reference paths and flags, writes one artifact and reports
//! diagnostics. [`ExternalCompiler`] drives any command-line compiler.

mod diagnostics;
mod external;

pub use diagnostics::parse_diagnostics;
pub use external::ExternalCompiler;

use crate::diagnostic::Diagnostic;
use crate::error::KilnResult;
use crate::resolve::CompilationUnit;
use async_trait::async_trait;
use std::path::PathBuf;

/// Max number of output lines kept when the compiler produces no parsable
/// diagnostics.
const OUTPUT_TAIL_LINES: usize = 50;

/// A single compiler invocation
#[derive(Debug, Clone)]
pub struct CompileJob {
    pub sources: Vec<PathBuf>,
    pub references: Vec<PathBuf>,
    pub args: Vec<String>,
    pub debug: bool,
    /// Where the compiler must write the artifact
    pub artifact: PathBuf,
}

impl CompileJob {
    pub fn from_unit(unit: &CompilationUnit, artifact: PathBuf) -> Self {
        Self {
            sources: unit.compile_paths().into_iter().map(PathBuf::from).collect(),
            references: unit.references.iter().map(|r| r.path.clone()).collect(),
            args: unit.compiler_args.clone(),
            debug: unit.debug,
            artifact,
        }
    }
}

/// Outcome of a compiler run that actually started
#[derive(Debug, Clone)]
pub struct CompilerOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub diagnostics: Vec<Diagnostic>,
}

/// A compiler backend
#[async_trait]
pub trait Compiler: Send + Sync {
    /// Identity folded into cache fingerprints; changes when the compiler
    /// binary changes.
    fn identity(&self) -> String;

    /// Run the compiler. `Err` only when the compiler could not be started;
    /// compile errors, crashes and timeouts are reported as failed output.
    async fn compile(&self, job: &CompileJob) -> KilnResult<CompilerOutput>;
}

/// Extract the useful tail of compiler output.
///
/// Combines stdout and stderr, then returns the last `OUTPUT_TAIL_LINES`
/// lines so a synthetic diagnostic stays readable.
pub(crate) fn output_tail(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_lines() {
        let stdout: String = (0..80).map(|i| format!("line {}\n", i)).collect();
        let tail = output_tail(&stdout, "last");
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), OUTPUT_TAIL_LINES);
        assert_eq!(lines[OUTPUT_TAIL_LINES - 1], "last");
    }

    #[test]
    fn tail_of_short_output() {
        assert_eq!(output_tail("a", "b"), "a\nb");
        assert_eq!(output_tail("", ""), "");
    }
}
