//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Kiln - run compiled-language scripts
///
/// Resolves //kiln_ directives, caches compiled artifacts and keeps a warm
/// build server so repeated runs skip the compiler.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Skip local .kiln.toml discovery
    #[arg(long, global = true)]
    pub no_local: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a script if needed and run it
    Run(RunArgs),

    /// Build a script and print the artifact path
    Build(BuildArgs),

    /// Show the resolved inputs, fingerprint and cache state of a script
    Inspect(InspectArgs),

    /// Manage build servers
    Server(ServerArgs),

    /// Manage the build cache
    Cache(CacheArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Flags shared by `run` and `build`
#[derive(Parser, Debug, Clone)]
pub struct BuildArgs {
    /// Build with debug flags
    #[arg(long, conflicts_with = "release")]
    pub debug: bool,

    /// Build with release flags (default)
    #[arg(long)]
    pub release: bool,

    /// Rebuild even when a cached artifact is valid
    #[arg(long)]
    pub force: bool,

    /// Build server port (default: from config)
    #[arg(long)]
    pub port: Option<u16>,

    /// Build in this process instead of on the build server
    #[arg(long)]
    pub no_server: bool,

    /// Extra compiler argument (repeatable)
    #[arg(long = "co", value_name = "ARG", allow_hyphen_values = true)]
    pub compiler_args: Vec<String>,

    /// Extra reference, resolved like //kiln_ref (repeatable)
    #[arg(short = 'r', long = "reference", value_name = "REF")]
    pub references: Vec<String>,

    /// Copy the artifact to this path
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Script to build
    pub script: PathBuf,
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub build: BuildArgs,

    /// Arguments passed to the script
    #[arg(last = true)]
    pub args: Vec<String>,
}

/// Arguments for the inspect command
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Script to inspect
    pub script: PathBuf,

    /// Inspect the debug build
    #[arg(long)]
    pub debug: bool,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the server command
#[derive(Parser, Debug)]
pub struct ServerArgs {
    /// Subcommand for server
    #[command(subcommand)]
    pub action: ServerAction,
}

/// Server subcommands
#[derive(Subcommand, Debug)]
pub enum ServerAction {
    /// Start a build server in the background
    Start {
        /// Server port (default: from config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Stop a build server
    Stop {
        /// Server port (default: from config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Stop then start a build server
    Restart {
        /// Server port (default: from config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Check whether a build server answers
    Ping {
        /// Server port (default: from config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Serve builds in the foreground
    Listen {
        /// Server port (default: from config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// List running build servers
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Stop every running build server
    Kill,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., compiler.program)
        key: String,
        /// Value to set
        value: String,
        /// Write to project-local .kiln.toml instead of global config
        #[arg(long)]
        local: bool,
    },
}

/// Output format for list commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cached artifacts
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Show the cache entry for a script
    Info {
        /// Script to look up
        script: PathBuf,

        /// Look up the debug build
        #[arg(long)]
        debug: bool,
    },

    /// Remove every cached artifact
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run() {
        let cli = Cli::parse_from(["kiln", "run", "--debug", "hello.c", "--", "a", "-b"]);
        match cli.command {
            Commands::Run(args) => {
                assert!(args.build.debug);
                assert_eq!(args.build.script, PathBuf::from("hello.c"));
                assert_eq!(args.args, vec!["a", "-b"]);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_build_flags() {
        let cli = Cli::parse_from([
            "kiln",
            "build",
            "--force",
            "--port",
            "18000",
            "--co",
            "-Wall",
            "--co",
            "-DX=1",
            "-r",
            "m",
            "-o",
            "out/hello",
            "hello.c",
        ]);
        match cli.command {
            Commands::Build(args) => {
                assert!(args.force);
                assert!(!args.debug);
                assert_eq!(args.port, Some(18000));
                assert_eq!(args.compiler_args, vec!["-Wall", "-DX=1"]);
                assert_eq!(args.references, vec!["m"]);
                assert_eq!(args.output, Some(PathBuf::from("out/hello")));
            }
            _ => panic!("expected Build command"),
        }
    }

    #[test]
    fn debug_conflicts_with_release() {
        let result = Cli::try_parse_from(["kiln", "build", "--debug", "--release", "a.c"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_parses_server_actions() {
        let cli = Cli::parse_from(["kiln", "server", "start", "--port", "17005"]);
        match cli.command {
            Commands::Server(args) => {
                assert!(matches!(args.action, ServerAction::Start { port: Some(17005) }));
            }
            _ => panic!("expected Server command"),
        }

        let cli = Cli::parse_from(["kiln", "server", "kill"]);
        assert!(matches!(
            cli.command,
            Commands::Server(ServerArgs {
                action: ServerAction::Kill
            })
        ));
    }

    #[test]
    fn cli_parses_cache_clear() {
        let cli = Cli::parse_from(["kiln", "cache", "clear", "--yes"]);
        match cli.command {
            Commands::Cache(args) => {
                assert!(matches!(args.action, CacheAction::Clear { yes: true }));
            }
            _ => panic!("expected Cache command"),
        }
    }

    #[test]
    fn cli_no_local_flag() {
        let cli = Cli::parse_from(["kiln", "--no-local", "config", "path"]);
        assert!(cli.no_local);
    }

    #[test]
    fn cli_verbose_levels() {
        let cli = Cli::parse_from(["kiln", "server", "list"]);
        assert_eq!(cli.verbose, 0);

        let cli = Cli::parse_from(["kiln", "-v", "server", "list"]);
        assert_eq!(cli.verbose, 1);

        let cli = Cli::parse_from(["kiln", "-vv", "server", "list"]);
        assert_eq!(cli.verbose, 2);
    }
}
