use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// `ENDIT_CONFIG` overrides `--config` when set and `--config` is absent
/// (SPEC_FULL §6 "Environment").
fn default_config_path() -> PathBuf {
    std::env::var_os("ENDIT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/endit.conf"))
}

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Path to the `key = value` config file. Falls back to `$ENDIT_CONFIG`,
    /// then `/etc/endit.conf`.
    #[arg(short, long, default_value_os_t = default_config_path())]
    pub config: PathBuf,
    /// Enables human-friendly logging instead of JSON.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the archiver daemon only.
    Archiver,
    /// Run the retriever daemon only.
    Retriever,
    /// Run the deleter daemon only.
    Deleter,
    /// Run all three daemons as independent supervised tasks in one process.
    Run,
}
