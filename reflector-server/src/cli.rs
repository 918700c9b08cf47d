//! Command-line interface (spec.md §6 "CLI & exit codes", SPEC_FULL.md §4.13). Ported from
//! `services/authenticator`'s clap `App`/`Arg` usage to clap's derive API; the flags themselves
//! are unchanged.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "reflector-server", author = "Bush Hammer Industries", version)]
pub struct Cli {
    /// Run as a background daemon.
    #[arg(long)]
    pub daemon: bool,

    /// Path to the TOML config file.
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,

    /// Path to write the process id to.
    #[arg(long, value_name = "PATH")]
    pub pidfile: Option<PathBuf>,

    /// Path to write logs to instead of the terminal.
    #[arg(long, value_name = "PATH")]
    pub logfile: Option<PathBuf>,

    /// Unix user to drop privileges to after binding the listening port.
    #[arg(long, value_name = "NAME")]
    pub user: Option<String>,
}
