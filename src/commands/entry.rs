//! Entry command handlers - clone, inspect, build and read cache entries

use serde_json::json;

use crate::cli::{CloneArgs, EntryArgs, ReadArgs, WaitArgs};
use crate::commands::{
    entry_json, entry_path, entry_text, failure, wait_until_settled, CommandContext,
};
use crate::error::{CacheError, Result};
use crate::facade::{CacheFacade, FileContent, ReadOutcome};
use crate::key::CacheStrategy;

/// Run the clone command
pub async fn run_clone(
    args: &CloneArgs,
    facade: &CacheFacade,
    ctx: &CommandContext,
) -> Result<String> {
    let strategy = args.strategy.map(CacheStrategy::from);
    let mut status = facade
        .resolve(&args.source, args.branch.as_deref(), strategy)
        .await?;
    if args.wait.wait {
        status = wait_until_settled(facade, &status.entry.path, &args.wait).await?;
    }
    Ok(ctx.render(&entry_json(&status, "clone"), || {
        entry_text(&status, ctx.verbose)
    }))
}

/// Run the status command
pub fn run_status(args: &EntryArgs, facade: &CacheFacade, ctx: &CommandContext) -> Result<String> {
    let path = entry_path(facade.root(), &args.path);
    let status = facade.status(&path)?;
    Ok(ctx.render(&entry_json(&status, "status"), || {
        entry_text(&status, ctx.verbose)
    }))
}

/// Run the build command
pub async fn run_build(args: &WaitArgs, facade: &CacheFacade, ctx: &CommandContext) -> Result<String> {
    let path = entry_path(facade.root(), &args.entry.path);
    let build = facade.ensure_built(&path).await?;
    tracing::debug!(path = %path.display(), state = build.state.as_str(), "Build requested");

    let status = if args.wait.wait {
        wait_until_settled(facade, &path, &args.wait).await?
    } else {
        facade.status(&path)?
    };
    Ok(ctx.render(&entry_json(&status, "build"), || {
        entry_text(&status, ctx.verbose)
    }))
}

/// Run the refresh command
pub async fn run_refresh(
    args: &WaitArgs,
    facade: &CacheFacade,
    ctx: &CommandContext,
) -> Result<String> {
    let path = entry_path(facade.root(), &args.entry.path);
    let outcome = facade.refresh(&path).await?;

    let status = if args.wait.wait {
        wait_until_settled(facade, &path, &args.wait).await?
    } else {
        facade.status(&path)?
    };
    let mut value = entry_json(&status, "refresh");
    value["rebuildStarted"] = json!(outcome.started());

    Ok(ctx.render(&value, || {
        let mut out = entry_text(&status, ctx.verbose);
        if !outcome.started() {
            out.push_str("note: a build was already running\n");
        }
        out
    }))
}

/// Run the branches command
pub async fn run_branches(
    args: &EntryArgs,
    facade: &CacheFacade,
    ctx: &CommandContext,
) -> Result<String> {
    let path = entry_path(facade.root(), &args.path);
    let branches = facade.list_branches(&path).await?;

    let value = json!({
        "_type": "branches",
        "path": path.to_string_lossy(),
        "branches": branches,
    });
    Ok(ctx.render(&value, || {
        let mut out = String::new();
        for branch in &branches {
            out.push_str(branch);
            out.push('\n');
        }
        out
    }))
}

/// Run the map command
pub fn run_map(args: &EntryArgs, facade: &CacheFacade, ctx: &CommandContext) -> Result<String> {
    let path = entry_path(facade.root(), &args.path);
    let map = match facade.read_map(&path)? {
        ReadOutcome::Ready { content } => content,
        ReadOutcome::NotReady { reason, .. } => {
            return Err(CacheError::NotReady { path, reason })
        }
        ReadOutcome::Failed { error } => {
            return Err(failure(facade.status(&path)?.readiness, error))
        }
    };

    let value = json!({
        "_type": "map",
        "path": path.to_string_lossy(),
        "map": map,
    });
    Ok(ctx.render(&value, || {
        let mut out = map.clone();
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out
    }))
}

/// Run the read command
pub fn run_read(args: &ReadArgs, facade: &CacheFacade, ctx: &CommandContext) -> Result<String> {
    let path = entry_path(facade.root(), &args.entry.path);
    let content = match facade.read_file(&path, &args.relative)? {
        ReadOutcome::Ready { content } => content,
        ReadOutcome::NotReady { reason, .. } => {
            return Err(CacheError::NotReady { path, reason })
        }
        ReadOutcome::Failed { error } => return Err(CacheError::CloneFailed { message: error }),
    };

    let mut value = serde_json::to_value(&content).unwrap_or_default();
    value["_type"] = json!("read");
    value["path"] = json!(path.to_string_lossy());
    value["relative"] = json!(args.relative.to_string_lossy());

    Ok(ctx.render(&value, || match &content {
        FileContent::File { text } => text.clone(),
        FileContent::Directory { entries } => {
            let mut out = String::new();
            for name in entries {
                out.push_str(name);
                out.push('\n');
            }
            out
        }
    }))
}
