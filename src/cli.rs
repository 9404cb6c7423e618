use clap::{Parser, Subcommand};
use log::LevelFilter;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Maximum log level printed to stderr.
    #[arg(long, global = true, default_value_t = LevelFilter::Info)]
    pub log_level: LevelFilter,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Demo { cpus: 2 })
    }
}

#[derive(Clone, Debug, Subcommand)]
pub enum Commands {
    /// Bring up a simulated cluster and walk through a cross-processor wake
    /// and a few signal-delivery scenarios.
    Demo {
        /// Number of simulated processors attached to the shared region.
        #[arg(long, default_value_t = 2)]
        cpus: u32,
    },

    /// Print the shared-region layout and per-partition statistics.
    Stats,
}
