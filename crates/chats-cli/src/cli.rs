use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CLI surface for the `chats-archive` binary.
#[derive(Parser, Debug)]
#[command(
    name = "chats-archive",
    about = "Local, encrypted, integrity-verified conversation archive",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Archive directory (overrides `archive_dir` from the config file).
    #[arg(long, global = true, value_name = "DIR")]
    pub archive_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store the session bearer token in the OS credential store.
    AuthSetup {
        /// Token value; read from stdin when omitted.
        #[arg(long)]
        token: Option<String>,
    },
    /// Check whether a token is configured and accepted.
    AuthStatus,
    /// Remove the stored session token.
    AuthClear,
    /// Fetch and archive conversations.
    Export {
        /// Resume a previous export job by id.
        #[arg(long, value_name = "JOB_ID")]
        resume: Option<String>,
        /// Re-fetch records even when a valid local copy exists.
        #[arg(long)]
        force_refetch: bool,
    },
    /// Import conversations from a provider JSON export file.
    ImportJson {
        #[arg(long, short = 'f')]
        file: PathBuf,
    },
    /// List archived conversations (metadata only).
    List,
    /// Print one conversation as a transcript.
    Read {
        /// Conversation id (or prefix).
        id: String,
    },
    /// Write every valid conversation to a Markdown file.
    ExportMarkdown {
        #[arg(long, short = 'o', value_name = "DIR")]
        output: PathBuf,
    },
    /// Show archive statistics.
    Status,
    /// Verify every wrapper file without printing content.
    VerifyArchive,
    /// Show export job history, or one job in detail.
    Jobs {
        job_id: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print (or write) the archive key for backup.
    KeyExport {
        /// Write to this file (owner-only) instead of stdout.
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Restore the archive key from a backup.
    KeyImport {
        #[arg(long, short = 'f', conflicts_with = "key")]
        file: Option<PathBuf>,
        #[arg(long, short = 'k')]
        key: Option<String>,
    },
    /// Re-encrypt the archive with a freshly generated key.
    RotateKey,
    /// Probe the listing and detail endpoints with the stored token.
    VerifyApi,
    /// Report the remote API health classification.
    DiagnoseApi,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
