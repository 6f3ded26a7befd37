use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::models::{Backend, JobStatus, Style};

#[derive(Parser)]
#[command(name = "autoscribe", about = "Topic-driven article generation and scheduled publishing")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file
    Validate,

    /// Generate an article for a topic and wait for it
    Generate {
        /// Topic name
        topic: String,

        #[arg(long, value_enum)]
        style: Option<Style>,

        /// Pin the backend (disables fallback)
        #[arg(long, value_enum)]
        backend: Option<Backend>,

        #[arg(long)]
        priority: Option<i64>,

        /// Write the generated content to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Publish today's ready posts now (within the daily quota), or one post
    Publish {
        /// Publish only this post
        #[arg(long)]
        post: Option<String>,
    },

    /// Replace a post's content from a file
    Edit {
        /// Post id
        post: String,

        #[arg(long)]
        file: PathBuf,
    },

    /// List jobs
    Jobs {
        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Local model management
    Models {
        #[command(subcommand)]
        command: ModelCommands,
    },

    /// Switch the active settings record
    Activate {
        #[command(subcommand)]
        target: ActivateCommands,
    },
}

#[derive(Subcommand)]
pub enum ModelCommands {
    /// List known local models
    List,
    /// Refresh the model list from the local server
    Sync,
    /// Download a model and refresh the list
    Pull { name: String },
    /// Make a model the active local model
    Activate { name: String },
}

#[derive(Subcommand)]
pub enum ActivateCommands {
    /// Activate generation settings by name
    Generation { name: String },
    /// Activate scheduler settings by name
    Scheduler { name: String },
}
