//! Source transforms applied before directive scanning
//!
//! A precompiler receives the raw text of one source file on stdin and
//! writes the transformed text to stdout. The transformed text is what gets
//! scanned for directives and compiled.

use crate::error::{KilnError, KilnResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Transform applied to source text before scanning
#[async_trait]
pub trait Precompiler: Send + Sync {
    async fn transform(&self, name: &str, file: &Path, text: &str) -> KilnResult<String>;
}

/// Runs precompilers as external executables
pub struct ExternalPrecompiler {
    search_dirs: Vec<PathBuf>,
}

impl ExternalPrecompiler {
    /// Precompilers are looked up in `search_dirs` before `PATH`
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    fn locate(&self, name: &str, file: &Path) -> KilnResult<PathBuf> {
        let script_dir = file.parent().unwrap_or_else(|| Path::new("."));

        let candidate = Path::new(name);
        if candidate.is_absolute() {
            return Ok(candidate.to_path_buf());
        }
        let local = script_dir.join(candidate);
        if local.is_file() {
            return Ok(local);
        }

        let dirs = std::iter::once(script_dir.to_path_buf()).chain(self.search_dirs.iter().cloned());
        if let Ok(paths) = std::env::join_paths(dirs) {
            if let Ok(found) = which::which_in(name, Some(paths), script_dir) {
                return Ok(found);
            }
        }

        which::which(name).map_err(|e| KilnError::Precompiler {
            name: name.to_string(),
            file: file.to_path_buf(),
            reason: format!("not found: {}", e),
        })
    }
}

#[async_trait]
impl Precompiler for ExternalPrecompiler {
    async fn transform(&self, name: &str, file: &Path, text: &str) -> KilnResult<String> {
        let program = self.locate(name, file)?;
        debug!("Precompiling {} with {}", file.display(), program.display());

        let failed = |reason: String| KilnError::Precompiler {
            name: name.to_string(),
            file: file.to_path_buf(),
            reason,
        };

        let mut child = Command::new(&program)
            .arg(file)
            .env("KILN_SOURCE", file)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failed(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| failed("stdin not captured".to_string()))?;
        let input = text.to_string();
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(input.as_bytes()).await;
            drop(stdin);
            result
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| failed(e.to_string()))?;
        // A transform may exit without reading all input; that is not an error
        let _ = writer.await;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout).map_err(|_| failed("output is not UTF-8".to_string()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn transforms_via_stdin_stdout() {
        let temp = TempDir::new().unwrap();
        write_script(temp.path(), "upper", "#!/bin/sh\ntr 'a-z' 'A-Z'\n");
        let source = temp.path().join("main.c");
        std::fs::write(&source, "abc").unwrap();

        let pc = ExternalPrecompiler::new(vec![]);
        let out = pc.transform("upper", &source, "abc").await.unwrap();
        assert_eq!(out, "ABC");
    }

    #[tokio::test]
    async fn failing_precompiler_reports_stderr() {
        let temp = TempDir::new().unwrap();
        write_script(temp.path(), "broken", "#!/bin/sh\necho boom >&2\nexit 3\n");
        let source = temp.path().join("main.c");

        let pc = ExternalPrecompiler::new(vec![]);
        let err = pc.transform("broken", &source, "x").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("boom"));
        assert!(msg.contains("exit code 3"));
    }

    #[tokio::test]
    async fn missing_precompiler_errors() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("main.c");
        let pc = ExternalPrecompiler::new(vec![]);
        let err = pc
            .transform("kiln-no-such-precompiler", &source, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Precompiler { .. }));
    }
}
