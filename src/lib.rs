//! codemap-cache: repository cache and code-map build orchestrator
//!
//! Keeps a bounded set of repository working copies on local disk, each
//! keyed deterministically by source, branch and cache strategy. Clones and
//! code-map builds run as background work; callers get an answer right away
//! and poll status. All lifecycle state lives in one lock-protected metadata
//! document, so it survives restarts and is shared between processes using
//! the same cache root.
//!
//! # Example
//!
//! ```ignore
//! use codemap_cache::{CacheConfig, CacheFacade, ReadOutcome};
//!
//! let facade = CacheFacade::open(CacheConfig::load(None)?)?;
//! let status = facade.resolve("https://github.com/org/repo", Some("main"), None).await?;
//!
//! // later
//! match facade.read_map(&status.entry.path)? {
//!     ReadOutcome::Ready { content } => println!("{}", content),
//!     ReadOutcome::NotReady { reason, .. } => eprintln!("not yet: {}", reason),
//!     ReadOutcome::Failed { error } => eprintln!("failed: {}", error),
//! }
//! ```

pub mod build;
pub mod cli;
pub mod clone;
pub mod commands;
pub mod config;
pub mod error;
pub mod eviction;
pub mod facade;
pub mod fs_utils;
pub mod git;
pub mod key;
pub mod metadata;
pub mod process;

// Re-export commonly used types
pub use build::{BuildOrchestrator, BuildOutcome, BuildRequest, CommandEngine, MapEngine};
pub use clone::{CloneOrchestrator, CloneOutcome};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use eviction::{EvictionManager, EvictionReport};
pub use facade::{
    CacheFacade, CacheFacadeBuilder, EntryStatus, FileContent, ReadOutcome, Readiness,
    ShutdownReport, SweepReport,
};
pub use git::{GitCli, VersionControl};
pub use key::{CacheStrategy, KeyResolver};
pub use metadata::{BuildState, BuildStatus, CacheEntry, CloneState, CloneStatus, MetadataStore};
