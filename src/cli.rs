//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - daemon: run the scheduler daemon in the foreground
//! - submit: push a generation request through admission and moderation
//! - list/status: inspect the queue
//! - moderate/cancel: operator actions
//! - channel: channel management

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Spinq - request queue scheduler and generation orchestrator
#[derive(Parser, Debug)]
#[command(name = "spinq")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler daemon in the foreground
    Daemon,

    /// Submit a generation request
    Submit {
        /// Submitting user id
        #[arg(short, long)]
        user: String,

        /// Destination channel
        #[arg(short = 'C', long, default_value = "main")]
        channel: String,

        /// Base priority
        #[arg(short, long, default_value_t = 50)]
        priority: i32,

        /// The generation prompt
        prompt: String,
    },

    /// List requests
    List {
        /// Filter by state (submitted, moderating, queued, generating, ...)
        #[arg(short, long)]
        state: Option<String>,

        /// Filter by channel
        #[arg(short = 'C', long)]
        channel: Option<String>,
    },

    /// Show a request's full record
    Status {
        /// Request id
        id: String,
    },

    /// Record a moderation verdict
    Moderate {
        /// Request id
        id: String,

        /// Verdict: approved, rejected, or needs_review
        #[arg(short = 'V', long)]
        verdict: String,

        /// Optional reason
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Cancel a request
    Cancel {
        /// Request id
        id: String,
    },

    /// Channel management
    Channel {
        #[command(subcommand)]
        command: ChannelCommands,
    },
}

/// Channel subcommands
#[derive(Subcommand, Debug)]
pub enum ChannelCommands {
    /// Create or update a channel
    Add {
        /// Channel id
        id: String,

        /// Display name (defaults to the id)
        #[arg(short, long)]
        name: Option<String>,

        /// Queue size cap
        #[arg(short, long, default_value_t = 100)]
        max_queue_size: u32,
    },

    /// List channels
    List,
}
