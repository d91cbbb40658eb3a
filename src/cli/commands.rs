//! CLI command definitions using clap.
//!
//! - run: execute a job and print its report
//! - check: load a job and register its modules without running it
//! - show-config: print the resolved job configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Streamscope - scoped-cache lifecycle scheduler for run/lumi/stream transitions
#[derive(Parser, Debug)]
#[command(name = "streamscope")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (defaults to run)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Job file named by the subcommand, falling back to --config
    pub fn job_path(&self) -> Option<&PathBuf> {
        let job = match &self.command {
            Some(Commands::Run { job, .. }) | Some(Commands::Check { job }) | Some(Commands::ShowConfig { job }) => {
                job.as_ref()
            }
            None => None,
        };
        job.or(self.config.as_ref())
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a job and report its transitions
    Run {
        /// Job file (YAML)
        job: Option<PathBuf>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a job file without running it
    Check {
        /// Job file (YAML)
        job: Option<PathBuf>,
    },

    /// Print the resolved job configuration
    ShowConfig {
        /// Job file (YAML)
        job: Option<PathBuf>,
    },
}
