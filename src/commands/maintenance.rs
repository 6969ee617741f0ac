//! Maintenance command handlers - list, remove, evict, sweep and reset

use serde_json::json;

use crate::cli::{EntryArgs, ResetArgs};
use crate::commands::{entry_json, entry_path, CommandContext};
use crate::error::{CacheError, Result};
use crate::facade::CacheFacade;

/// Run the list command
pub fn run_list(facade: &CacheFacade, ctx: &CommandContext) -> Result<String> {
    let entries = facade.list()?;
    let max_entries = facade.config().max_entries;

    let value = json!({
        "_type": "cache_list",
        "cache_root": facade.root().to_string_lossy(),
        "entries": entries.len(),
        "max_entries": max_entries,
        "items": entries.iter().map(|e| entry_json(e, "entry")).collect::<Vec<_>>(),
    });

    Ok(ctx.render(&value, || {
        let mut out = String::new();
        out.push_str(&format!("cache_root: {}\n", facade.root().display()));
        out.push_str(&format!("entries: {}/{}\n", entries.len(), max_entries));
        if entries.is_empty() {
            out.push_str("\nNo cached repositories.\n");
            return out;
        }
        out.push('\n');
        for status in &entries {
            let entry = &status.entry;
            out.push_str(&format!("  - path: {}\n", entry.path.display()));
            out.push_str(&format!("    source: {}\n", entry.source_location));
            if let Some(branch) = &entry.branch {
                out.push_str(&format!("    branch: {}\n", branch));
            }
            out.push_str(&format!("    readiness: {}\n", status.readiness.as_str()));
            if ctx.verbose {
                out.push_str(&format!(
                    "    last_access: {}\n",
                    entry.last_access.to_rfc3339()
                ));
            }
        }
        out
    }))
}

/// Run the remove command
pub fn run_remove(args: &EntryArgs, facade: &CacheFacade, ctx: &CommandContext) -> Result<String> {
    let path = entry_path(facade.root(), &args.path);
    let removed = facade.remove(&path)?;

    let value = json!({
        "_type": "cache_remove",
        "path": removed.path.to_string_lossy(),
        "source": removed.source_location,
    });
    Ok(ctx.render(&value, || {
        format!("Removed {} ({})\n", removed.path.display(), removed.source_location)
    }))
}

/// Run the evict command
pub fn run_evict(facade: &CacheFacade, ctx: &CommandContext) -> Result<String> {
    let report = facade.evict()?;

    let mut value = serde_json::to_value(&report).unwrap_or_default();
    value["_type"] = json!("cache_evict");
    value["over_capacity"] = json!(report.over_capacity());

    Ok(ctx.render(&value, || {
        let mut out = String::new();
        out.push_str(&format!(
            "entries: {}/{}\n",
            report.remaining, report.max_entries
        ));
        out.push_str(&format!("evicted: {}\n", report.evicted.len()));
        for path in &report.evicted {
            out.push_str(&format!("  - {}\n", path.display()));
        }
        if !report.failed.is_empty() {
            out.push_str(&format!("could_not_delete: {}\n", report.failed.len()));
            for path in &report.failed {
                out.push_str(&format!("  - {}\n", path.display()));
            }
        }
        if let Some(e) = report.capacity_error() {
            out.push_str(&format!("warning: {}\n", e));
        }
        out
    }))
}

/// Run the sweep command
pub fn run_sweep(facade: &CacheFacade, ctx: &CommandContext) -> Result<String> {
    let report = facade.sweep()?;

    let mut value = serde_json::to_value(&report).unwrap_or_default();
    value["_type"] = json!("cache_sweep");

    Ok(ctx.render(&value, || {
        if report.is_empty() {
            return "Nothing stale.\n".to_string();
        }
        let mut out = String::new();
        for path in &report.clones {
            out.push_str(&format!("stale clone: {}\n", path.display()));
        }
        for path in &report.updates {
            out.push_str(&format!("stale update: {}\n", path.display()));
        }
        for path in &report.builds {
            out.push_str(&format!("stale build: {}\n", path.display()));
        }
        out
    }))
}

/// Run the reset command
pub fn run_reset(args: &ResetArgs, facade: &CacheFacade, ctx: &CommandContext) -> Result<String> {
    if !args.force {
        return Err(CacheError::config(
            "reset deletes every cached working copy; pass --force to confirm",
        ));
    }
    let backup = facade.reset()?;

    let value = json!({
        "_type": "cache_reset",
        "cache_root": facade.root().to_string_lossy(),
        "quarantined_metadata": backup.as_ref().map(|p| p.to_string_lossy().into_owned()),
    });
    Ok(ctx.render(&value, || {
        let mut out = format!("Reset cache at {}\n", facade.root().display());
        if let Some(backup) = &backup {
            out.push_str(&format!("previous metadata kept at {}\n", backup.display()));
        }
        out
    }))
}
