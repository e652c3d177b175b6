//! Resolved build input

use crate::diagnostic::Diagnostic;
use crate::directive::MacroInvocation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// SHA-256 of file contents as lowercase hex
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// A source file read during resolution
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Absolute path, the file's identity
    pub path: PathBuf,
    /// File handed to the compiler (precompiler output when rewritten)
    pub compile_path: PathBuf,
    pub text: String,
    pub modified: DateTime<Utc>,
    /// Hash of the text that gets compiled
    pub hash: String,
}

impl SourceFile {
    /// Whether a precompiler rewrote this file
    pub fn is_precompiled(&self) -> bool {
        self.path != self.compile_path
    }
}

/// A resolved native library reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub path: PathBuf,
    pub hash: String,
    pub modified: DateTime<Utc>,
}

/// Options that shape a resolution pass
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Debug (true) or release (false) build
    pub debug: bool,
    /// References given on the command line, resolved like `//kiln_ref`
    pub references: Vec<String>,
    /// Extra compiler flags appended after directive flags
    pub args: Vec<String>,
    /// Copy the artifact here after building
    pub output: Option<PathBuf>,
}

/// Everything needed to hand a script to the compiler
#[derive(Debug, Clone)]
pub struct CompilationUnit {
    pub primary: PathBuf,
    /// Primary first, then includes in discovery order
    pub sources: Vec<SourceFile>,
    pub references: Vec<Reference>,
    pub probing_dirs: Vec<PathBuf>,
    pub compiler_args: Vec<String>,
    pub debug: bool,
    pub output: Option<PathBuf>,
    pub macros: Vec<MacroInvocation>,
    /// Non-fatal warnings collected while scanning
    pub diagnostics: Vec<Diagnostic>,
}

impl CompilationUnit {
    /// Build mode label used in fingerprints and metadata
    pub fn mode(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "release"
        }
    }

    /// Files the compiler should read, in order
    pub fn compile_paths(&self) -> Vec<&Path> {
        self.sources.iter().map(|s| s.compile_path.as_path()).collect()
    }

    /// Whether the unit contains a source file
    pub fn contains_source(&self, path: &Path) -> bool {
        self.sources.iter().any(|s| s.path == path)
    }

    /// Stem of the primary script, used to name the artifact
    pub fn script_name(&self) -> String {
        self.primary
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("script")
            .to_string()
    }
}
