mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use dh_agents::prelaunch::CooldownChoice;
use dh_core::config::{Config, LogFormat};
use dh_core::types::CliType;
use uuid::Uuid;

/// dockhand -- run AI coding agents in throwaway containers.
#[derive(Parser)]
#[command(name = "dockhand", version, about)]
struct Cli {
    /// Config file to use instead of ~/.dockhand/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task in an environment and stream its progress.
    Run {
        /// Environment id from the config.
        #[arg(short, long)]
        env: String,
        /// Instruction handed to the agent.
        #[arg(short, long)]
        prompt: String,
        /// Prepared host checkout mounted as the workspace.
        #[arg(short, long)]
        workdir: PathBuf,
        /// Branch the agent should work on.
        #[arg(short, long)]
        branch: Option<String>,
        /// What to do if the primary agent is cooling down.
        #[arg(long, value_enum)]
        on_cooldown: Option<OnCooldown>,
        /// Emit events and the final result as JSON lines.
        #[arg(long)]
        json: bool,
    },

    /// Inspect or clear agent cooldowns.
    Cooldown {
        #[command(subcommand)]
        action: CooldownAction,
    },

    /// Browse encrypted task artifacts.
    Artifacts {
        #[command(subcommand)]
        action: ArtifactAction,
    },

    /// Show the effective configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum CooldownAction {
    /// Show every agent CLI's availability.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Clear a cooldown so the agent is used again immediately.
    Clear { cli: CliType },
}

#[derive(Subcommand)]
enum ArtifactAction {
    /// List a task's artifacts, or every task with artifacts.
    List { task: Option<Uuid> },
    /// Decrypt an artifact to a file or stdout.
    Get {
        id: Uuid,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Permanently delete an artifact.
    Delete { id: Uuid },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML.
    Show,
    /// Print the default config file location.
    Path,
}

#[derive(Clone, Copy, ValueEnum)]
enum OnCooldown {
    Fallback,
    Bypass,
    Cancel,
}

impl From<OnCooldown> for CooldownChoice {
    fn from(value: OnCooldown) -> Self {
        match value {
            OnCooldown::Fallback => CooldownChoice::UseFallback,
            OnCooldown::Bypass => CooldownChoice::Bypass,
            OnCooldown::Cancel => CooldownChoice::Cancel,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => Config::load_from(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load().context("loading config")?,
    };
    dh_telemetry::logging::init(
        &cfg.general.project_name,
        &cfg.general.log_level,
        cfg.general.log_format == LogFormat::Json,
    );

    match cli.command {
        Commands::Run {
            env,
            prompt,
            workdir,
            branch,
            on_cooldown,
            json,
        } => {
            let opts = commands::run::RunOptions {
                environment_id: env,
                prompt,
                workdir,
                branch,
                on_cooldown: on_cooldown.map(CooldownChoice::from),
                json,
            };
            let succeeded = commands::run::run(&cfg, opts).await?;
            return Ok(if succeeded { ExitCode::SUCCESS } else { ExitCode::FAILURE });
        }
        Commands::Cooldown { action } => match action {
            CooldownAction::Status { json } => commands::cooldown::status(&cfg, json)?,
            CooldownAction::Clear { cli } => commands::cooldown::clear(&cfg, cli)?,
        },
        Commands::Artifacts { action } => match action {
            ArtifactAction::List { task } => commands::artifacts::list(&cfg, task)?,
            ArtifactAction::Get { id, out } => commands::artifacts::get(&cfg, id, out.as_deref())?,
            ArtifactAction::Delete { id } => commands::artifacts::delete(&cfg, id)?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config::show(&cfg)?,
            ConfigAction::Path => println!("{}", Config::default_path().display()),
        },
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_cooldown_choice() {
        let cli = Cli::try_parse_from([
            "dockhand",
            "run",
            "--env",
            "web",
            "--prompt",
            "fix the login form",
            "--workdir",
            "/tmp/repo",
            "--on-cooldown",
            "fallback",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                env, on_cooldown, json, ..
            } => {
                assert_eq!(env, "web");
                assert!(matches!(on_cooldown, Some(OnCooldown::Fallback)));
                assert!(!json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parses_cli_type_for_clear() {
        let cli = Cli::try_parse_from(["dockhand", "cooldown", "clear", "opencode"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cooldown {
                action: CooldownAction::Clear { cli: CliType::OpenCode }
            }
        ));
        assert!(Cli::try_parse_from(["dockhand", "cooldown", "clear", "cursor"]).is_err());
    }
}
