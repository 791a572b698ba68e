//! Command-line surface.

pub mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "clipforge",
    version,
    about = "Crash-resilient batch pipeline that clips highlight segments out of recordings"
)]
pub struct Cli {
    /// Manifest database path.
    #[arg(long, global = true, default_value = "clipforge.db")]
    pub db: PathBuf,

    /// Directory for rolling log files.
    #[arg(long, global = true, default_value = "logs")]
    pub log_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan inputs, resolve them against the manifest, and process the queue.
    Process(ProcessArgs),

    /// Inspect or manipulate the queue without scanning.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Verify the environment: encoder binaries and manifest database.
    Check,
}

#[derive(Args, Debug)]
pub struct ProcessArgs {
    /// Input file or directory to scan.
    #[arg(long)]
    pub input: PathBuf,

    #[command(flatten)]
    pub run: RunArgs,

    /// Re-queue artifacts even on a cache hit.
    #[arg(long)]
    pub force: bool,

    /// Recurse into subdirectories.
    #[arg(long)]
    pub recursive: bool,

    /// Extension allow-list (comma separated, e.g. mp4,mkv).
    #[arg(long, value_delimiter = ',')]
    pub ext: Vec<String>,

    /// Enqueue at most this many discovered artifacts.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Resolve and enqueue only; do not start workers.
    #[arg(long)]
    pub no_process: bool,
}

/// Options shared by anything that runs workers.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Directory rendered clips are written to.
    #[arg(long, default_value = "clips")]
    pub output: PathBuf,

    /// JSON configuration file merged over the defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Worker slot count (overrides the configuration).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Stop after this many jobs across all workers.
    #[arg(long)]
    pub max_jobs: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Per-status counts plus terminally failed jobs.
    Status,

    /// Drain the existing queue without scanning for new inputs.
    Process(RunArgs),

    /// Re-queue all failed jobs with a fresh attempt budget.
    Retry,

    /// Delete all non-running jobs from the manifest.
    Clear {
        /// Also drop audit history for the deleted jobs.
        #[arg(long)]
        manifest: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn process_flags_parse() {
        let cli = Cli::parse_from([
            "clipforge",
            "process",
            "--input",
            "/videos",
            "--recursive",
            "--ext",
            "mp4,mkv",
            "--workers",
            "4",
            "--force",
        ]);
        match cli.command {
            Commands::Process(args) => {
                assert!(args.recursive);
                assert!(args.force);
                assert_eq!(args.ext, vec!["mp4", "mkv"]);
                assert_eq!(args.run.workers, Some(4));
            }
            _ => panic!("expected process command"),
        }
    }

    #[test]
    fn queue_clear_manifest_flag_parses() {
        let cli = Cli::parse_from(["clipforge", "queue", "clear", "--manifest"]);
        match cli.command {
            Commands::Queue {
                command: QueueCommands::Clear { manifest },
            } => assert!(manifest),
            _ => panic!("expected queue clear"),
        }
    }
}
