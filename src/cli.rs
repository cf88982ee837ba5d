//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Fast, resumable download manager.
///
/// Parget splits each download into parallel byte-range segments,
/// checkpoints progress so interrupted transfers pick up where they left
/// off, and resolves supported file-hosting pages into direct links.
#[derive(Parser, Debug)]
#[command(name = "parget")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands of the parget binary.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download one or more URLs
    Download {
        /// URLs to download (direct links or supported file-host pages)
        #[arg(required = true)]
        urls: Vec<String>,

        /// Directory downloads are written into (default: ~/Downloads)
        #[arg(short = 'o', long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Connections per download (1-32)
        #[arg(short = 't', long, value_parser = clap::value_parser!(u8).range(1..=32))]
        threads: Option<u8>,

        /// Maximum downloads transferring at once (1-100)
        #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
        concurrency: Option<u8>,
    },

    /// Resume a paused or failed download from its checkpoint
    Resume {
        /// Job id as printed by `parget jobs`
        job_id: String,
    },

    /// List jobs with a resume checkpoint on disk
    Jobs,
}
