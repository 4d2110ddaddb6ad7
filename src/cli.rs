//! Command-line interface: argument parsing and command dispatch.

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::app::AppContext;
use crate::commands;
use crate::orchestrator::Orchestrator;
use crate::output::TerminalReporter;
use crate::reaper;

#[derive(Parser)]
#[command(
    name = "fermata",
    version,
    about = "Remote compute instances with activity tracking and idle auto-stop"
)]
pub struct Cli {
    /// Disable colored output.
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Suppress progress output.
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Show full error chains and backtraces.
    #[arg(long, global = true, env = "FERMATA_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List instances (default: everything not yet terminated).
    List {
        /// State to filter by, or "all" to include terminated instances.
        state: Option<String>,
    },
    /// Accumulated runtime cost per tracked instance.
    Costs,
    /// Create and provision a new instance from its profile.
    Create { name: String },
    /// Start a stopped instance.
    Start { name: String },
    /// Stop a running instance.
    Stop { name: String },
    /// Terminate an instance. Protected profiles are refused.
    Terminate {
        name: String,
        /// Skip the confirmation prompt.
        #[arg(long, short)]
        yes: bool,
    },
    /// Open an interactive shell (or run one command) in the instance's
    /// virtualenv.
    Ssh {
        name: String,
        command: Option<String>,
    },
    /// Run a command on the instance with the profile's vars set.
    Run {
        name: String,
        #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Install the profile's base package set.
    Install { name: String },
    /// Ship the app package set and run the entrypoint.
    Deploy {
        name: String,
        /// Only reship local: packages.
        #[arg(long)]
        no_deps: bool,
    },
    /// Create a machine image from the instance.
    Snapshot { name: String, image: String },
    /// Print an instance profile as resolved from config.
    Config { name: String },
    /// One idle-reaper sweep (intended for cron).
    Reap,
}

impl Cli {
    /// Dispatch the parsed command.
    ///
    /// # Errors
    ///
    /// Returns the failure of the underlying command.
    pub async fn run(self) -> Result<ExitCode> {
        let app = AppContext::load(self.no_color, self.quiet)?;
        let reporter = TerminalReporter::new(&app.output);
        let backend = app.backend()?;
        let orch = Orchestrator::new(backend, &app.store, &app.config, &reporter);

        match self.command {
            Command::List { state } => {
                let rows =
                    commands::list_rows(&orch.provider, &app.config, &app.output, state.as_deref())
                        .await?;
                for row in rows {
                    println!("{row}");
                }
            }
            Command::Costs => {
                let rows = commands::cost_rows(&orch.provider, &app.store, &app.config).await?;
                for row in rows {
                    println!("{row}");
                }
            }
            Command::Create { name } => {
                orch.create(&name).await?;
            }
            Command::Start { name } => orch.start(&name).await?,
            Command::Stop { name } => orch.stop(&name).await?,
            Command::Terminate { name, yes } => {
                if app.confirm(&format!("terminate {name}?"), yes)? {
                    orch.terminate(&name).await?;
                }
            }
            Command::Ssh { name, command } => {
                if let Some(status) = orch.ssh(&name, command.as_deref()).await? {
                    return Ok(exit_code(status));
                }
            }
            Command::Run { name, command } => {
                if let Some(status) = orch.run(&name, &command.join(" ")).await? {
                    return Ok(exit_code(status));
                }
            }
            Command::Install { name } => orch.install(&name).await?,
            Command::Deploy { name, no_deps } => orch.deploy(&name, no_deps).await?,
            Command::Snapshot { name, image } => {
                orch.snapshot(&name, &image).await?;
            }
            Command::Config { name } => {
                let profile = app.config.profile(&name)?;
                print!("{}", serde_yaml::to_string(profile)?);
            }
            Command::Reap => reaper::run(&orch).await?,
        }
        Ok(ExitCode::SUCCESS)
    }
}

/// Map a remote command's exit status onto our own.
fn exit_code(status: std::process::ExitStatus) -> ExitCode {
    match status.code() {
        Some(code) => ExitCode::from(u8::try_from(code.rem_euclid(256)).unwrap_or(1)),
        None => ExitCode::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parses_list_with_optional_state() {
        let cli = Cli::parse_from(["fermata", "list"]);
        assert!(matches!(cli.command, Command::List { state: None }));
        let cli = Cli::parse_from(["fermata", "list", "stopped"]);
        assert!(matches!(cli.command, Command::List { state: Some(s) } if s == "stopped"));
    }

    #[test]
    fn parses_run_with_trailing_command() {
        let cli = Cli::parse_from(["fermata", "run", "web", "nvidia-smi", "-l", "1"]);
        match cli.command {
            Command::Run { name, command } => {
                assert_eq!(name, "web");
                assert_eq!(command, vec!["nvidia-smi", "-l", "1"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_a_command() {
        assert!(Cli::try_parse_from(["fermata", "run", "web"]).is_err());
    }

    #[test]
    fn parses_terminate_with_yes_flag() {
        let cli = Cli::parse_from(["fermata", "terminate", "web", "--yes"]);
        assert!(matches!(cli.command, Command::Terminate { yes: true, .. }));
    }

    #[test]
    fn global_flags_apply_anywhere() {
        let cli = Cli::parse_from(["fermata", "list", "--quiet", "--no-color"]);
        assert!(cli.quiet);
        assert!(cli.no_color);
    }

    #[test]
    fn parses_deploy_no_deps() {
        let cli = Cli::parse_from(["fermata", "deploy", "web", "--no-deps"]);
        assert!(matches!(cli.command, Command::Deploy { no_deps: true, .. }));
    }
}
