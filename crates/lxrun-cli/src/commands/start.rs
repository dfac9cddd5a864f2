//! `lxrun start`: run a command as a container.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Args;
use lxrun_common::config::ContainerConfig;
use lxrun_runtime::handler::Collaborators;

/// Arguments for the `start` command.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Container name.
    #[arg(short, long)]
    pub name: String,

    /// JSON configuration file.
    #[arg(short = 'f', long)]
    pub config: Option<PathBuf>,

    /// Number of ttys to allocate, overriding the configuration.
    #[arg(short, long)]
    pub ttys: Option<usize>,

    /// Hostname inside the container, overriding the configuration.
    #[arg(long)]
    pub hostname: Option<String>,

    /// Command to run as the container init.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `start` command.
///
/// The process exits with the container's exit code.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the container could
/// not be started.
pub fn execute(args: StartArgs) -> anyhow::Result<ExitCode> {
    let config = build_config(&args)?;
    let collab = Collaborators::system(&config)?;

    let code = lxrun_runtime::start::start(&args.name, &args.command, config, collab)
        .with_context(|| format!("failed to start container '{}'", args.name))?;
    tracing::debug!(name = %args.name, code, "start finished");
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)))
}

fn build_config(args: &StartArgs) -> anyhow::Result<ContainerConfig> {
    let mut config = match &args.config {
        Some(path) => ContainerConfig::load(path)
            .with_context(|| format!("cannot load configuration {}", path.display()))?,
        None => ContainerConfig::default(),
    };
    if let Some(ttys) = args.ttys {
        config.tty_count = ttys;
    }
    if let Some(hostname) = &args.hostname {
        config.hostname = Some(hostname.clone());
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    use crate::commands::{Cli, Command};

    fn parse(args: &[&str]) -> StartArgs {
        match Cli::try_parse_from(args).unwrap().command {
            Command::Start(args) => args,
            Command::Console(_) => unreachable!(),
        }
    }

    #[test]
    fn trailing_command_keeps_its_flags() {
        let args = parse(&["lxrun", "start", "-n", "web", "--", "sh", "-c", "echo hi"]);
        assert_eq!(args.name, "web");
        assert_eq!(args.command, vec!["sh", "-c", "echo hi"]);
    }

    #[test]
    fn command_line_overrides_defaults() {
        let args = parse(&["lxrun", "start", "-n", "web", "-t", "2", "--hostname", "box", "true"]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.tty_count, 2);
        assert_eq!(config.hostname.as_deref(), Some("box"));
    }

    #[test]
    fn too_many_ttys_are_rejected() {
        let args = parse(&["lxrun", "start", "-n", "web", "-t", "1000", "true"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn missing_command_is_a_usage_error() {
        assert!(Cli::try_parse_from(["lxrun", "start", "-n", "web"]).is_err());
    }
}
