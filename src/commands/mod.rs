//! Command handlers for the codemap-cache CLI
//!
//! Each handler takes its `Args` struct from `cli.rs`, the opened facade and
//! a shared `CommandContext`, and returns the rendered output:
//! - `entry` - clone, status, build, refresh, branches, map, read
//! - `maintenance` - list, remove, evict, sweep, reset

pub mod entry;
pub mod maintenance;

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

pub use entry::{
    run_branches, run_build, run_clone, run_map, run_read, run_refresh, run_status,
};
pub use maintenance::{run_evict, run_list, run_remove, run_reset, run_sweep};

use crate::cli::{Commands, OutputFormat, WaitFlags};
use crate::error::{CacheError, Result};
use crate::facade::{CacheFacade, EntryStatus, Readiness};
use crate::key;

const WAIT_POLL: Duration = Duration::from_millis(500);

/// Shared context passed to all command handlers
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Output format (text or json)
    pub format: OutputFormat,
    /// Show verbose output
    pub verbose: bool,
}

impl Default for CommandContext {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            verbose: false,
        }
    }
}

impl CommandContext {
    pub fn from_cli(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    /// Render `value` as pretty JSON, or as text via `text`
    pub fn render<F>(&self, value: &serde_json::Value, text: F) -> String
    where
        F: FnOnce() -> String,
    {
        match self.format {
            OutputFormat::Json => {
                let mut out = serde_json::to_string_pretty(value).unwrap_or_default();
                out.push('\n');
                out
            }
            OutputFormat::Text => text(),
        }
    }
}

/// Dispatch a parsed subcommand
pub async fn run_command(
    command: &Commands,
    facade: &CacheFacade,
    ctx: &CommandContext,
) -> Result<String> {
    match command {
        Commands::Clone(args) => run_clone(args, facade, ctx).await,
        Commands::Status(args) => run_status(args, facade, ctx),
        Commands::Build(args) => run_build(args, facade, ctx).await,
        Commands::Refresh(args) => run_refresh(args, facade, ctx).await,
        Commands::Branches(args) => run_branches(args, facade, ctx).await,
        Commands::Map(args) => run_map(args, facade, ctx),
        Commands::Read(args) => run_read(args, facade, ctx),
        Commands::List => run_list(facade, ctx),
        Commands::Remove(args) => run_remove(args, facade, ctx),
        Commands::Evict => run_evict(facade, ctx),
        Commands::Sweep => run_sweep(facade, ctx),
        Commands::Reset(args) => run_reset(args, facade, ctx),
    }
}

/// Map a command-line entry argument onto a working-copy path.
///
/// A bare name is taken as a cache key under the repos directory; anything
/// else is a path, made absolute against the current directory.
pub fn entry_path(root: &Path, raw: &Path) -> PathBuf {
    let mut components = raw.components();
    if let (Some(Component::Normal(name)), None) = (components.next(), components.next()) {
        if !raw.exists() {
            return root.join(key::REPOS_DIR).join(name);
        }
    }
    if raw.is_absolute() {
        return raw.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => crate::fs_utils::normalize_path(&cwd.join(raw)),
        Err(_) => raw.to_path_buf(),
    }
}

/// Poll an entry until it settles, then turn failures into errors.
///
/// An entry that is cloned with nothing building it has settled too.
pub async fn wait_until_settled(
    facade: &CacheFacade,
    path: &Path,
    flags: &WaitFlags,
) -> Result<EntryStatus> {
    let limit = Duration::from_secs(flags.wait_timeout);
    let deadline = Instant::now() + limit;
    loop {
        let status = facade.status(path)?;
        let idle_clone = status.readiness == Readiness::Cloned && !facade.has_background_work();
        if status.readiness.is_terminal() || idle_clone {
            return settled(status);
        }
        if Instant::now() >= deadline {
            return Err(CacheError::Timeout {
                program: format!("wait for {}", path.display()),
                after: limit,
            });
        }
        tracing::debug!(path = %path.display(), readiness = status.readiness.as_str(), "Waiting");
        tokio::time::sleep(WAIT_POLL).await;
    }
}

fn settled(status: EntryStatus) -> Result<EntryStatus> {
    let error = match status.readiness {
        Readiness::CloneFailed => status.entry.clone_status.error.clone(),
        Readiness::BuildFailed => status.entry.build_status.error.clone(),
        _ => return Ok(status),
    };
    Err(failure(status.readiness, error.unwrap_or_default()))
}

/// Error for an entry that reached a failed state
pub fn failure(readiness: Readiness, message: String) -> CacheError {
    match readiness {
        Readiness::CloneFailed => CacheError::CloneFailed { message },
        _ => CacheError::BuildFailed { message },
    }
}

/// JSON value for an entry, tagged with `_type`
pub fn entry_json(status: &EntryStatus, kind: &str) -> serde_json::Value {
    let mut value = serde_json::to_value(status).unwrap_or_default();
    if let Some(object) = value.as_object_mut() {
        object.insert("_type".to_string(), serde_json::json!(kind));
    }
    value
}

/// Text block describing one entry
pub fn entry_text(status: &EntryStatus, verbose: bool) -> String {
    let entry = &status.entry;
    let mut out = String::new();
    out.push_str(&format!("path: {}\n", entry.path.display()));
    out.push_str(&format!("source: {}\n", entry.source_location));
    out.push_str(&format!(
        "branch: {}\n",
        entry.branch.as_deref().unwrap_or("(default)")
    ));
    out.push_str(&format!("strategy: {}\n", entry.cache_strategy.as_str()));
    out.push_str(&format!("readiness: {}\n", status.readiness.as_str()));
    out.push_str(&format!("clone: {}\n", entry.clone_status.state.as_str()));
    if let Some(error) = &entry.clone_status.error {
        out.push_str(&format!("  error: {}\n", error));
    }
    out.push_str(&format!("build: {}\n", entry.build_status.state.as_str()));
    if let Some(error) = &entry.build_status.error {
        out.push_str(&format!("  error: {}\n", error));
    }
    if let Some(output) = &entry.build_status.output_location {
        out.push_str(&format!("map: {}\n", output.display()));
    }
    if verbose {
        out.push_str(&format!("last_access: {}\n", entry.last_access.to_rfc3339()));
        if let Some(id) = entry.build_status.build_id {
            out.push_str(&format!("build_id: {}\n", id));
        }
        if let Some(pid) = entry.build_status.process_handle {
            out.push_str(&format!("engine_pid: {}\n", pid));
        }
        if let Some(at) = entry.build_status.completed_at {
            out.push_str(&format!("built_at: {}\n", at.to_rfc3339()));
        }
    }
    out
}
