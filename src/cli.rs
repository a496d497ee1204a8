//! Command line dispatch for the agent binary.

use crate::envsetup::{self, Mode};
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set up the environment inside a freshly spawned subprocess, then
    /// exec the next stage. Internal; invoked by the spawners.
    SpawnEnvSetupper {
        /// The spawn work directory to report into.
        work_dir: PathBuf,
        /// Run the pre-shell phase (ulimits, user switching, chdir).
        #[arg(long, conflicts_with = "after")]
        before: bool,
        /// Run the post-shell phase (env vars, application exec).
        #[arg(long)]
        after: bool,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::SpawnEnvSetupper {
            work_dir,
            before,
            after,
        } => {
            let mode = match (before, after) {
                (true, false) => Mode::Before,
                (false, true) => Mode::After,
                _ => bail!("exactly one of --before or --after is required"),
            };
            // Success execs into the next stage; any return is a failure
            // already materialized into the work dir.
            std::process::exit(envsetup::run(&work_dir, mode));
        }
    }
}
