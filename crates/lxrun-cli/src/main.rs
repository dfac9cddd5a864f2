//! # lxrun
//!
//! Runs a command inside fresh Linux namespaces, supervises it until it
//! exits, and hands out consoles to its pseudo-terminals.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod commands;

use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::commands::Cli;

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli)?;
    commands::execute(cli)
}

/// `RUST_LOG` wins over `--log-level`; `--quiet` silences everything but
/// errors.
fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let default_level = if cli.quiet { "error" } else { cli.log_level.as_str() };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)
            .with_context(|| format!("invalid log level '{default_level}'"))?,
    };

    let writer = match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(cli.log_file.is_none())
        .init();
    Ok(())
}
