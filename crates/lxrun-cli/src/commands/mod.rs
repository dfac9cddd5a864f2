//! CLI command definitions and dispatch.

pub mod console;
pub mod start;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use lxrun_common::constants::BIN_NAME;

/// lxrun: run a command in its own namespaces.
#[derive(Parser, Debug)]
#[command(name = BIN_NAME, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(short = 'l', long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Append logs to this file instead of stderr.
    #[arg(short = 'o', long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Only log errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command as a container and wait for it to exit.
    Start(start::StartArgs),
    /// Attach the terminal to one of a running container's ttys.
    Console(console::ConsoleArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Start(args) => start::execute(args),
        Command::Console(args) => console::execute(&args),
    }
}
