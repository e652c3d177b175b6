//! Configuration schema for kiln
//!
//! Configuration is stored at `~/.config/kiln/config.toml`, optionally
//! overlaid by a project-local `.kiln.toml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// External compiler settings
    pub compiler: CompilerConfig,

    /// Build cache settings
    pub cache: CacheConfig,

    /// Build server settings
    pub server: ServerConfig,

    /// Dependency resolution settings
    pub resolve: ResolveConfig,

    /// Package registry settings
    pub packages: PackagesConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Append server and build events to the event log
    pub event_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            event_log: true,
        }
    }
}

/// External compiler invocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Compiler executable (name on PATH or absolute path)
    pub program: String,

    /// Flags passed on every invocation
    pub args: Vec<String>,

    /// Flags added for debug builds
    pub debug_args: Vec<String>,

    /// Flags added for release builds
    pub release_args: Vec<String>,

    /// Flag preceding the output path
    pub output_flag: String,

    /// Flag preceding each reference; references are positional when unset
    pub reference_flag: Option<String>,

    /// Kill the compiler after this many seconds (0 = no limit)
    pub timeout_secs: u64,

    /// Extension of the produced artifact (none for native executables)
    pub artifact_extension: Option<String>,

    /// Command prefix used to execute the artifact (e.g. ["java", "-jar"])
    pub runner: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: "cc".to_string(),
            args: vec![],
            debug_args: vec!["-g".to_string(), "-O0".to_string()],
            release_args: vec!["-O2".to_string()],
            output_flag: "-o".to_string(),
            reference_flag: None,
            timeout_secs: 300,
            artifact_extension: None,
            runner: vec![],
        }
    }
}

/// Build cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Persist compiled artifacts (default: true)
    pub enabled: bool,

    /// Cache root override (default: `<state dir>/cache`)
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

/// Build server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Route builds through the build server
    pub enabled: bool,

    /// Start a server automatically when none is listening
    pub auto_start: bool,

    /// Default server identity (local TCP port)
    pub port: u16,

    /// Shut down after this many idle seconds (0 = never)
    pub idle_timeout_secs: u64,

    /// How long `stop` waits before force-terminating
    pub stop_timeout_ms: u64,

    /// How long `start` waits for the server to answer pings
    pub start_timeout_ms: u64,

    /// How long shutdown waits for in-flight builds
    pub drain_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_start: true,
            port: 17001,
            idle_timeout_secs: 600,
            stop_timeout_ms: 3000,
            start_timeout_ms: 5000,
            drain_timeout_ms: 10_000,
        }
    }
}

/// Dependency resolution configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveConfig {
    /// Directories searched after the script directory and probing directories
    pub search_roots: Vec<PathBuf>,

    /// Precompilers applied to every source file before scanning
    pub precompilers: Vec<String>,
}

/// Package registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagesConfig {
    /// Registry base URL (packages cannot be fetched when unset)
    pub registry: Option<String>,

    /// Package store override (default: `<state dir>/packages`)
    pub dir: Option<PathBuf>,

    /// HTTP timeout in seconds
    pub timeout_secs: u64,
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            registry: None,
            dir: None,
            timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[compiler]"));
        assert!(toml.contains("[server]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.compiler.program, "cc");
        assert_eq!(config.server.port, 17001);
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [server]
            port = 18000
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 18000);
        assert_eq!(config.server.idle_timeout_secs, 600); // default preserved
        assert!(config.cache.enabled);
    }
}
