//! `lxrun console`: attach to a container tty.

use std::process::ExitCode;

use clap::Args;
use lxrun_runtime::console::Console;

/// Arguments for the `console` command.
#[derive(Args, Debug)]
pub struct ConsoleArgs {
    /// Container name.
    #[arg(short, long)]
    pub name: String,

    /// Tty number; 0 takes the first free one.
    #[arg(short, long, default_value_t = 0)]
    pub tty: i32,
}

/// Executes the `console` command.
///
/// # Errors
///
/// Returns an error if no tty is available or the terminal cannot be put
/// into raw mode.
#[allow(clippy::print_stderr)]
pub fn execute(args: &ConsoleArgs) -> anyhow::Result<ExitCode> {
    let console = Console::connect(&args.name, args.tty)
        .map_err(|e| anyhow::anyhow!("cannot attach to '{}': {e}", args.name))?;

    eprintln!("\nConnected to tty {}", console.index());
    eprintln!("Type <Ctrl+a q> to exit\n");

    console.attach().map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(ExitCode::SUCCESS)
}
