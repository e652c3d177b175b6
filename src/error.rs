//! Error types for kiln
//!
//! All modules use `KilnResult<T>` as their return type. Malformed directives
//! are not errors: the scanner reports them as warning diagnostics instead.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// All errors that can occur in kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Resolution errors
    #[error("Include not found: {path} (referenced from {}:{line})", file.display())]
    IncludeNotFound {
        path: String,
        file: PathBuf,
        line: usize,
    },

    #[error("Reference not found: {name} (referenced from {}:{line})", file.display())]
    ReferenceNotFound {
        name: String,
        file: PathBuf,
        line: usize,
    },

    #[error("Script includes itself: {} (from {}:{line})", primary.display(), file.display())]
    SelfInclude {
        primary: PathBuf,
        file: PathBuf,
        line: usize,
    },

    #[error("Package not found: {name} {requirement}")]
    PackageNotFound { name: String, requirement: String },

    #[error("Failed to fetch package {name}: {reason}")]
    PackageFetch { name: String, reason: String },

    #[error("Precompiler {name} failed on {}: {reason}", file.display())]
    Precompiler {
        name: String,
        file: PathBuf,
        reason: String,
    },

    #[error("Script not found: {0}")]
    ScriptNotFound(PathBuf),

    // Cache errors
    #[error("Cache directory unusable at {}: {reason}", path.display())]
    CacheIo { path: PathBuf, reason: String },

    // Compiler errors
    #[error("Compilation failed with {errors} error(s)")]
    Compile { errors: usize },

    #[error("Compiler not found: {0}")]
    CompilerNotFound(String),

    // Server errors
    #[error("Build server on port {port} unreachable: {reason}")]
    ServerTransport { port: u16, reason: String },

    #[error("Build server protocol error: {0}")]
    ServerProtocol(String),

    #[error("Build server on port {port} did not become ready within {waited_ms}ms")]
    ServerStartTimeout { port: u16, waited_ms: u64 },

    #[error("Registry lock failed: {0}")]
    RegistryLock(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process terminated by signal")]
    ProcessSignaled,

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PackageFetch { .. } | Self::ServerTransport { .. } | Self::RegistryLock(_)
        )
    }

    /// Whether this error came out of dependency resolution
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            Self::IncludeNotFound { .. }
                | Self::ReferenceNotFound { .. }
                | Self::SelfInclude { .. }
                | Self::PackageNotFound { .. }
                | Self::PackageFetch { .. }
                | Self::Precompiler { .. }
                | Self::ScriptNotFound(_)
        )
    }

    /// Source location the error points at, if any
    pub fn location(&self) -> Option<(PathBuf, usize)> {
        match self {
            Self::IncludeNotFound { file, line, .. }
            | Self::ReferenceNotFound { file, line, .. }
            | Self::SelfInclude { file, line, .. } => Some((file.clone(), *line)),
            _ => None,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::IncludeNotFound { .. } | Self::ReferenceNotFound { .. } => {
                Some("Add a //kiln_dir directive or resolve.search_roots entry")
            }
            Self::PackageNotFound { .. } => Some("Check packages.registry in your config"),
            Self::PackageFetch { .. } => Some("Network failure, retry the build"),
            Self::CompilerNotFound(_) => Some("Run: kiln config set compiler.program <path>"),
            Self::ServerTransport { .. } => Some("Run with --no-server to build in-process"),
            _ => None,
        }
    }
}
