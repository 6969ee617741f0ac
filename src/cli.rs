//! Command-line interface definition using clap derive
//!
//! Each subcommand maps onto one cache facade operation. Long work started
//! by `clone`, `build` and `refresh` runs in the background; the process
//! stays alive until that work finishes, and `--wait` additionally reports
//! the terminal state instead of the accepted one.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::key::CacheStrategy;

/// Repository cache and code-map build orchestrator
#[derive(Parser, Debug)]
#[command(name = "codemap-cache")]
#[command(about = "Bounded cache of repository working copies with background code-map builds")]
#[command(version, propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true, value_name = "FILE", env = "CODEMAP_CACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, default_value = "text", value_enum, global = true)]
    pub format: OutputFormat,

    /// Show debug logging and extra detail
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    // ========================================================================
    // Entry lifecycle
    // ========================================================================
    /// Resolve a source to a working copy, cloning it if needed
    ///
    /// Examples:
    ///   codemap-cache clone https://github.com/org/repo.git
    ///   codemap-cache clone git@github.com:org/repo.git --branch develop --strategy per-branch
    ///   codemap-cache clone ./local/checkout --wait
    Clone(CloneArgs),

    /// Show the state of one entry (runs stale sweeps first)
    Status(EntryArgs),

    /// Build the code map for a cloned entry if it is missing
    Build(WaitArgs),

    /// Update the working copy from its source and rebuild
    Refresh(WaitArgs),

    // ========================================================================
    // Reads
    // ========================================================================
    /// List branches of an entry's source repository
    Branches(EntryArgs),

    /// Print the code map of a ready entry
    Map(EntryArgs),

    /// Print a file or list a directory inside a working copy
    Read(ReadArgs),

    // ========================================================================
    // Maintenance
    // ========================================================================
    /// List all entries, most recently used first
    List,

    /// Delete one idle entry with its working copy and artifacts
    Remove(EntryArgs),

    /// Evict least recently used entries down to the configured limit
    Evict,

    /// Mark clones and builds that stopped reporting progress as failed
    Sweep,

    /// Quarantine the metadata store and delete every working copy
    Reset(ResetArgs),
}

/// Arguments for the `clone` subcommand
#[derive(Args, Debug)]
pub struct CloneArgs {
    /// Remote URL (https, ssh, git, file or scp-style) or local directory
    pub source: String,

    /// Branch or ref to check out (defaults to the remote default branch)
    #[arg(short, long)]
    pub branch: Option<String>,

    /// Whether branches share one working copy or get their own
    #[arg(short, long, value_enum)]
    pub strategy: Option<StrategyArg>,

    #[command(flatten)]
    pub wait: WaitFlags,
}

/// An entry given by working-copy path or bare cache key
#[derive(Args, Debug)]
pub struct EntryArgs {
    /// Working-copy path as printed by `clone`, or its cache key
    pub path: PathBuf,
}

#[derive(Args, Debug)]
pub struct WaitArgs {
    #[command(flatten)]
    pub entry: EntryArgs,

    #[command(flatten)]
    pub wait: WaitFlags,
}

#[derive(Args, Debug)]
pub struct WaitFlags {
    /// Block until the entry is ready or has failed
    #[arg(short, long)]
    pub wait: bool,

    /// Give up waiting after this many seconds
    #[arg(long, default_value = "3600", requires = "wait")]
    pub wait_timeout: u64,
}

#[derive(Args, Debug)]
pub struct ReadArgs {
    #[command(flatten)]
    pub entry: EntryArgs,

    /// Path relative to the working-copy root ("." for the root listing)
    #[arg(default_value = ".")]
    pub relative: PathBuf,
}

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// Required; reset deletes every cached working copy
    #[arg(long)]
    pub force: bool,
}

/// Output format for command results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON
    Json,
}

/// Cache strategy as spelled on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    /// One working copy per source; branch requests switch it
    Shared,
    /// One working copy per source and branch
    PerBranch,
}

impl From<StrategyArg> for CacheStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Shared => CacheStrategy::Shared,
            StrategyArg::PerBranch => CacheStrategy::PerBranch,
        }
    }
}
