//! Shell completion generation.

use clap::CommandFactory;
use clap_complete::{Shell, generate};
use std::io;

use crate::Cli;

/// Render the completion script for `shell`.
fn render(shell: Shell) -> Vec<u8> {
    let mut cmd = Cli::command();
    let name = cmd
        .get_name()
        .to_string();
    let mut buf = Vec::new();
    generate(shell, &mut cmd, name, &mut buf);
    buf
}

/// Write shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) -> io::Result<()> {
    use std::io::Write as _;

    let mut stdout = io::stdout().lock();
    stdout.write_all(&render(shell))?;
    stdout.flush()
}
