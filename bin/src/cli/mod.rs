//! CLI interpreter for the command line host

mod fetch;

use clap::{Parser, Subcommand};
use ezhttp::logger::{self, LogLevel};

/// ezhttp
///
/// Runs HTTP requests through the client engine, pumping it on a fixed tick the way
/// an embedding host would, and prints one JSON object per response.
#[derive(Parser)]
#[clap(version, about)]
pub(crate) struct Cli {
    /// Logging verbosity, logs are written to stderr as JSON
    #[clap(long, value_enum, default_value_t = LogLevel::Warn, global = true)]
    log_level: LogLevel,

    /// Subcommand
    #[clap(subcommand)]
    command: Commands,
}

/// Commands
#[derive(Subcommand)]
enum Commands {
    /// Send requests and print their responses
    Fetch(fetch::FetchCommand),
}

impl Cli {
    /// Execute the command
    pub(crate) fn exec(self) -> anyhow::Result<()> {
        logger::init(self.log_level)?;
        match self.command {
            Commands::Fetch(cmd) => cmd.exec(),
        }
    }
}
