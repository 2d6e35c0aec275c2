use crate::commands::mount::{execute_mount, MountArgs};
use crate::commands::preview::{execute_preview, PreviewArgs};
use crate::commands::tree::{execute_tree, TreeArgs};
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use stagehand_core::config::{ConfigLoader, PreviewConfig};
use stagehand_core::session::TargetKind;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

/// Kind of artifact the steps describe
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum TargetOption {
    /// Browser application with a dev server
    Frontend,
    /// Server-side code (not previewable)
    Backend,
}

impl From<TargetOption> for TargetKind {
    fn from(target: TargetOption) -> Self {
        match target {
            TargetOption::Frontend => TargetKind::Frontend,
            TargetOption::Backend => TargetKind::Backend,
        }
    }
}

/// stagehand subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Fold a step batch and print the resulting file tree as JSON
    Tree {
        /// Step batch file (JSON or JSON5 array of step records)
        #[arg(long, value_name = "FILE")]
        steps: PathBuf,
    },

    /// Print the mount description for a step batch
    Mount {
        /// Step batch file (JSON or JSON5 array of step records)
        #[arg(long, value_name = "FILE")]
        steps: PathBuf,
        /// Do not synthesize a missing package.json or index.html
        #[arg(long)]
        no_scaffold: bool,
    },

    /// Materialise a step batch and run it until the dev server is reachable
    Preview {
        /// Step batch file (JSON or JSON5 array of step records)
        #[arg(long, value_name = "FILE")]
        steps: PathBuf,
        /// Directory the project is materialised into (defaults to a per-user cache directory)
        #[arg(long, value_name = "DIR")]
        workdir: Option<PathBuf>,
        /// Kind of artifact the steps describe
        #[arg(long, value_enum, default_value = "frontend")]
        target: TargetOption,
        /// Port probed for readiness (can be repeated; overrides readyPorts)
        #[arg(long = "port", value_name = "PORT")]
        ports: Vec<u16>,
        /// Dependency install command line (overrides installCommand)
        #[arg(long, value_name = "COMMAND")]
        install_command: Option<String>,
        /// Dev server command line (overrides startCommand)
        #[arg(long, value_name = "COMMAND")]
        start_command: Option<String>,
        /// Install time budget in seconds
        #[arg(long, value_name = "SECS")]
        install_timeout: Option<u64>,
        /// Server startup time budget in seconds
        #[arg(long, value_name = "SECS")]
        start_timeout: Option<u64>,
        /// Retry a failed attempt this many times
        #[arg(long, default_value_t = 0)]
        retries: u32,
        /// Report the result and stop instead of serving until Ctrl-C
        #[arg(long)]
        detach: bool,
    },
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Generated project preview runner",
    long_about = "Generated project preview runner\n\nFolds generated build steps into a project tree, mounts it into a sandbox and drives dependency install and dev server startup until a preview URL is reachable.",
    color = clap::ColorChoice::Auto
)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via STAGEHAND_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Preview configuration file (defaults to stagehand.json/.jsonc/.toml in the current directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    pub async fn dispatch(self) -> Result<()> {
        // Initialize logging based on global options
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None, // Let logging module check environment variable
        };

        let mut log_level = match self.log_level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };

        // Spinner sessions: preview on a TTY stderr with text logs
        let stderr_is_tty = std::io::stderr().is_terminal();
        let json_format = matches!(log_format, Some("json"));
        let spinner_eligible = matches!(self.command, Some(Commands::Preview { .. }))
            && stderr_is_tty
            && !json_format;

        if std::env::var_os("STAGEHAND_LOG").is_none() && std::env::var_os("RUST_LOG").is_none() {
            // Keep the spinner line clean unless the user asked for more
            if spinner_eligible && matches!(self.log_level, LogLevel::Info) {
                log_level = "warn";
            }
            std::env::set_var(
                "RUST_LOG",
                format!("stagehand={},stagehand_core={}", log_level, log_level),
            );
        }
        stagehand_core::logging::init(log_format)?;
        tracing::debug!("CLI initialized with log level: {}", log_level);

        match self.command {
            Some(Commands::Tree { steps }) => execute_tree(TreeArgs { steps }),
            Some(Commands::Mount { steps, no_scaffold }) => {
                execute_mount(MountArgs { steps, no_scaffold })
            }
            Some(Commands::Preview {
                steps,
                workdir,
                target,
                ports,
                install_command,
                start_command,
                install_timeout,
                start_timeout,
                retries,
                detach,
            }) => {
                let config = load_config(self.config.as_deref())?;
                execute_preview(
                    PreviewArgs {
                        steps,
                        workdir,
                        target: target.into(),
                        ports,
                        install_command,
                        start_command,
                        install_timeout,
                        start_timeout,
                        retries,
                        detach,
                        spinner: spinner_eligible,
                    },
                    config,
                )
                .await
            }
            None => {
                // No subcommand provided - show help-like message
                println!("Generated project preview runner");
                println!("Run 'stagehand --help' to see available commands.");
                Ok(())
            }
        }
    }
}

/// Explicit `--config`, else a discovered file in the current directory, else defaults
fn load_config(explicit: Option<&Path>) -> Result<PreviewConfig> {
    if let Some(path) = explicit {
        return Ok(ConfigLoader::load_from_path(path)?);
    }
    match ConfigLoader::discover(Path::new(".")) {
        Some(path) => {
            tracing::debug!("Using discovered configuration {}", path.display());
            Ok(ConfigLoader::load_from_path(&path)?)
        }
        None => Ok(PreviewConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_preview_flags_parse() {
        let cli = Cli::try_parse_from([
            "stagehand",
            "preview",
            "--steps",
            "steps.json",
            "--target",
            "backend",
            "--port",
            "4000",
            "--port",
            "4001",
            "--install-timeout",
            "30",
            "--retries",
            "2",
            "--detach",
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Preview {
                target,
                ports,
                install_timeout,
                retries,
                detach,
                ..
            }) => {
                assert_eq!(target, TargetOption::Backend);
                assert_eq!(ports, vec![4000, 4001]);
                assert_eq!(install_timeout, Some(30));
                assert_eq!(retries, 2);
                assert!(detach);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stagehand",
            "tree",
            "--steps",
            "s.json",
            "--log-format",
            "json",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert!(matches!(cli.log_format, Some(LogFormat::Json)));
        assert!(matches!(cli.log_level, LogLevel::Debug));
    }

    #[test]
    fn test_load_config_defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.start_command.program, "npm");
    }
}
