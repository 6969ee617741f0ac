//! Clone orchestration
//!
//! Drives a cache entry from "unknown" to "checked out at the requested
//! ref". Creation of an entry happens inside a single metadata mutation, so
//! when several callers race on the same key exactly one of them launches
//! the clone and the rest observe it in progress. The clone itself runs as
//! a background task; callers never wait on network or disk time.
//!
//! A failed clone leaves no working copy behind: the partial directory is
//! removed in the same mutation that records the failure. The failed record
//! stays as a tombstone carrying the error text until the next request for
//! the key replaces it with a fresh attempt.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::build::BuildOrchestrator;
use crate::error::{CacheError, Result};
use crate::eviction::remove_entry_dirs;
use crate::fs_utils;
use crate::git::VersionControl;
use crate::key::{self, CacheStrategy, KeyResolver, SourceKind};
use crate::metadata::{
    CacheEntry, CacheIndex, CloneState, MetadataStore, UpdateKind, SHUTDOWN_REASON,
};

/// Result of a clone request
#[derive(Debug, Clone, PartialEq)]
pub enum CloneOutcome {
    /// A new clone was launched in the background
    Started(CacheEntry),
    /// Another request's clone is still running
    InProgress(CacheEntry),
    /// The working copy already exists at the requested ref
    Ready(CacheEntry),
    /// A shared working copy was switched to the requested ref
    CheckedOut(CacheEntry),
}

impl CloneOutcome {
    pub fn entry(&self) -> &CacheEntry {
        match self {
            CloneOutcome::Started(e)
            | CloneOutcome::InProgress(e)
            | CloneOutcome::Ready(e)
            | CloneOutcome::CheckedOut(e) => e,
        }
    }

    pub fn into_entry(self) -> CacheEntry {
        match self {
            CloneOutcome::Started(e)
            | CloneOutcome::InProgress(e)
            | CloneOutcome::Ready(e)
            | CloneOutcome::CheckedOut(e) => e,
        }
    }
}

/// What the creating mutation decided
enum Claim {
    Created(CacheEntry),
    Existing(CacheEntry),
}

/// How the working copy is materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Materialize {
    Git,
    Copy,
}

/// Launches clones and in-place checkouts
pub struct CloneOrchestrator {
    store: Arc<MetadataStore>,
    resolver: KeyResolver,
    vcs: Arc<dyn VersionControl>,
    builds: Arc<BuildOrchestrator>,
    stale_after: Duration,
    entry_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    owned: Mutex<HashMap<PathBuf, AbortHandle>>,
    /// Working copies this process is updating in place
    updating: Mutex<HashSet<PathBuf>>,
}

impl CloneOrchestrator {
    pub fn new(
        store: Arc<MetadataStore>,
        resolver: KeyResolver,
        vcs: Arc<dyn VersionControl>,
        builds: Arc<BuildOrchestrator>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            vcs,
            builds,
            stale_after,
            entry_locks: Mutex::new(HashMap::new()),
            owned: Mutex::new(HashMap::new()),
            updating: Mutex::new(HashSet::new()),
        }
    }

    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    pub fn vcs(&self) -> &Arc<dyn VersionControl> {
        &self.vcs
    }

    /// Per-entry async mutex serializing in-place working-copy changes
    pub fn entry_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.entry_locks
                .lock()
                .entry(path.to_path_buf())
                .or_default(),
        )
    }

    /// Number of clones this process is currently driving
    pub fn owned_count(&self) -> usize {
        self.owned.lock().len()
    }

    /// Request a working copy for `(source, branch, strategy)`.
    ///
    /// Returns as soon as the outcome is known: a new clone is launched in
    /// the background, while a checkout of a shared entry to another ref is
    /// performed inline (it touches no network unless the ref is unknown).
    pub async fn start(
        self: &Arc<Self>,
        source: &str,
        branch: Option<&str>,
        strategy: CacheStrategy,
    ) -> Result<CloneOutcome> {
        let kind = key::validate_source(source)?;
        let source = key::normalize_source(source);
        let branch = key::normalize_branch(branch);
        if let Some(branch) = &branch {
            key::validate_branch(&source, branch)?;
        }
        let materialize = materialize_for(kind, &source);
        if materialize == Materialize::Copy && branch.is_some() {
            return Err(CacheError::invalid_source(
                &source,
                "branches can only be requested for git repositories",
            ));
        }

        let path = self.resolver.resolve(&source, branch.as_deref(), strategy);
        let now = Utc::now();

        let claim = self.store.update(|index| {
            if let Some(existing) = index.get_mut(&path) {
                if existing.clone_status.state != CloneState::Failed {
                    existing.touch(now);
                    return Ok(Claim::Existing(existing.clone()));
                }
            }
            // New key, or a failed tombstone replaced by a fresh attempt.
            let mut entry =
                CacheEntry::new(path.clone(), source.clone(), branch.clone(), strategy, now);
            entry.mark_cloning(now);
            index.insert(entry.clone());
            Ok(Claim::Created(entry))
        })?;

        match claim {
            Claim::Created(entry) => {
                tracing::info!(path = %path.display(), source = %source, branch = ?branch, "Clone started");
                self.spawn_clone(entry.clone(), materialize);
                Ok(CloneOutcome::Started(entry))
            }
            Claim::Existing(entry) => match entry.clone_status.state {
                CloneState::Cloned
                    if strategy == CacheStrategy::Shared
                        && materialize == Materialize::Git
                        && entry.branch != branch =>
                {
                    self.switch_branch(&path, branch).await
                }
                CloneState::Cloned => Ok(CloneOutcome::Ready(entry)),
                _ => Ok(CloneOutcome::InProgress(entry)),
            },
        }
    }

    /// Current record for a working copy
    pub fn entry(&self, path: &Path) -> Result<Option<CacheEntry>> {
        Ok(self.store.read()?.get(path).cloned())
    }

    /// Check out `target` (or the default branch) in a shared working copy.
    ///
    /// Refused while the entry is busy. Requests naming the ref that is
    /// already checked out change nothing. A successful switch invalidates
    /// the previous build and starts a fresh one.
    async fn switch_branch(
        self: &Arc<Self>,
        path: &Path,
        target: Option<String>,
    ) -> Result<CloneOutcome> {
        let lock = self.entry_lock(path);
        let _guard = lock.lock().await;

        // Re-read under the entry lock: a concurrent request may have
        // switched already.
        let entry = self.entry(path)?.ok_or_else(|| CacheError::NotFound {
            path: path.to_path_buf(),
        })?;
        if !entry.is_cloned() {
            return Ok(CloneOutcome::InProgress(entry));
        }
        if entry.branch == target {
            return Ok(CloneOutcome::Ready(entry));
        }
        if entry.is_busy() {
            return Err(CacheError::AlreadyInProgress {
                path: path.to_path_buf(),
            });
        }

        let reference = self.resolve_ref(path, target.as_deref()).await?;
        let current = self.resolve_ref(path, entry.branch.as_deref()).await?;
        if current == reference {
            return Ok(CloneOutcome::Ready(entry));
        }

        self.claim_update(path, UpdateKind::Checkout)?;
        let result = self.vcs.checkout(path, &reference).await;
        let now = Utc::now();
        let updated = self.finish_update(path, |entry| {
            if result.is_ok() {
                entry.branch = target.clone();
                entry.invalidate_build();
                entry.touch(now);
            }
        })?;
        result?;
        tracing::info!(path = %path.display(), reference = %reference, "Checked out");

        if let Err(e) = self.builds.start_build(path) {
            tracing::warn!(path = %path.display(), "Could not start build after checkout: {}", e);
        }
        Ok(CloneOutcome::CheckedOut(updated))
    }

    /// Bring a cloned working copy up to date with its source.
    ///
    /// Git working copies are fast-forwarded. Copied local directories are
    /// copied again into a staging directory that replaces the working copy
    /// only once complete. On success the previous build is invalidated; on
    /// failure the working copy and its build are left as they were.
    pub async fn refresh(&self, path: &Path) -> Result<CacheEntry> {
        let entry = self.claim_update(path, UpdateKind::Refresh)?;
        let result = self.update_in_place(&entry).await;
        let now = Utc::now();
        let updated = self.finish_update(path, |entry| {
            if result.is_ok() {
                entry.invalidate_build();
                entry.touch(now);
            }
        })?;
        result?;
        Ok(updated)
    }

    async fn update_in_place(&self, entry: &CacheEntry) -> Result<()> {
        let path = &entry.path;
        if path.join(".git").exists() {
            let head = self.vcs.pull(path).await?;
            tracing::info!(path = %path.display(), head = %head, "Pulled latest changes");
            return Ok(());
        }

        let source = PathBuf::from(&entry.source_location);
        let dest = path.clone();
        let copied = tokio::task::spawn_blocking(move || fs_utils::replace_tree(&source, &dest))
            .await
            .map_err(|e| CacheError::CloneFailed {
                message: format!("copy did not finish: {}", e),
            })?
            .map_err(|e| CacheError::CloneFailed {
                message: format!("re-copy of {} failed: {}", entry.source_location, e),
            })?;
        tracing::info!(path = %path.display(), files = copied, "Re-copied local directory");
        Ok(())
    }

    /// Ref a request names, with `None` meaning the default branch
    async fn resolve_ref(&self, path: &Path, branch: Option<&str>) -> Result<String> {
        match branch {
            Some(branch) => Ok(branch.to_string()),
            None => self.vcs.default_branch(path).await,
        }
    }

    /// Persist the update marker, checking preconditions in the same mutation
    fn claim_update(&self, path: &Path, kind: UpdateKind) -> Result<CacheEntry> {
        let now = Utc::now();
        let claimed = self.store.update(|index| {
            let entry = index.get_mut(path).ok_or_else(|| CacheError::NotFound {
                path: path.to_path_buf(),
            })?;
            if entry.is_busy() {
                return Err(CacheError::AlreadyInProgress {
                    path: path.to_path_buf(),
                });
            }
            if !entry.begin_update(now, kind) {
                return Err(CacheError::NotReady {
                    path: path.to_path_buf(),
                    reason: format!("clone is {}", entry.clone_status.state.as_str()),
                });
            }
            Ok(entry.clone())
        })?;
        self.updating.lock().insert(path.to_path_buf());
        tracing::debug!(path = %path.display(), kind = kind.as_str(), "Working copy claimed");
        Ok(claimed)
    }

    /// Clear the update marker and apply the outcome in one mutation
    fn finish_update<F>(&self, path: &Path, apply: F) -> Result<CacheEntry>
    where
        F: FnOnce(&mut CacheEntry),
    {
        let finished = self.store.update(|index| {
            let entry = index.get_mut(path).ok_or_else(|| CacheError::NotFound {
                path: path.to_path_buf(),
            })?;
            entry.finish_update();
            apply(entry);
            Ok(entry.clone())
        });
        self.updating.lock().remove(path);
        finished
    }

    fn spawn_clone(self: &Arc<Self>, entry: CacheEntry, materialize: Materialize) {
        // Held across spawn + insert so the task cannot deregister first.
        let mut owned = self.owned.lock();
        let path = entry.path.clone();
        let task = tokio::spawn(Arc::clone(self).run_clone(entry, materialize));
        owned.insert(path, task.abort_handle());
    }

    async fn run_clone(self: Arc<Self>, entry: CacheEntry, materialize: Materialize) {
        let path = entry.path.clone();
        let result = self.materialize(&entry, materialize).await;
        let now = Utc::now();

        match result {
            Ok(()) => {
                let recorded = self.store.update(|index| {
                    Ok(index
                        .get_mut(&path)
                        .map(|e| e.mark_cloned(now))
                        .unwrap_or(false))
                });
                match recorded {
                    Ok(true) => {
                        tracing::info!(path = %path.display(), "Clone complete");
                        if let Err(e) = self.builds.start_build(&path) {
                            tracing::warn!(path = %path.display(), "Could not start build: {}", e);
                        }
                    }
                    Ok(false) => {
                        tracing::info!(path = %path.display(), "Clone result discarded; entry no longer cloning");
                    }
                    Err(e) => {
                        tracing::error!(path = %path.display(), "Failed to record clone result: {}", e);
                    }
                }
            }
            Err(e) => {
                let message = match &e {
                    CacheError::CloneFailed { message } => message.clone(),
                    other => other.to_string(),
                };
                match self.fail_clones(&[path.clone()], now, &message) {
                    Ok(n) if n > 0 => {
                        tracing::warn!(path = %path.display(), "Clone failed: {}", message)
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(path = %path.display(), "Failed to record clone failure: {}", e)
                    }
                }
            }
        }
        self.owned.lock().remove(&path);
    }

    async fn materialize(&self, entry: &CacheEntry, materialize: Materialize) -> Result<()> {
        let path = entry.path.clone();
        // Leftovers from a crashed or failed attempt would make the clone fail.
        let cleanup = path.clone();
        tokio::task::spawn_blocking(move || fs_utils::remove_tree(&cleanup))
            .await
            .map_err(|e| CacheError::CloneFailed {
                message: format!("cleanup did not finish: {}", e),
            })??;
        tokio::fs::create_dir_all(self.resolver.repos_dir()).await?;

        match materialize {
            Materialize::Git => {
                self.vcs
                    .clone_repo(&entry.source_location, &path, entry.branch.as_deref())
                    .await
            }
            Materialize::Copy => {
                let source = PathBuf::from(&entry.source_location);
                let copied = tokio::task::spawn_blocking(move || fs_utils::copy_tree(&source, &path))
                    .await
                    .map_err(|e| CacheError::CloneFailed {
                        message: format!("copy did not finish: {}", e),
                    })?
                    .map_err(|e| CacheError::CloneFailed {
                        message: format!("copy of {} failed: {}", entry.source_location, e),
                    })?;
                tracing::debug!(path = %entry.path.display(), files = copied, "Copied local directory");
                Ok(())
            }
        }
    }

    /// Mark clones failed and remove their working copies and artifacts in
    /// one mutation. Returns the number of entries changed.
    fn fail_clones(&self, paths: &[PathBuf], now: DateTime<Utc>, message: &str) -> Result<usize> {
        let resolver = &self.resolver;
        self.store.update(|index| {
            let mut failed = 0;
            for path in paths {
                let Some(entry) = index.get_mut(path) else {
                    continue;
                };
                if !entry.mark_clone_failed(now, message) {
                    continue;
                }
                failed += 1;
                remove_entry_dirs(resolver, path);
            }
            Ok(failed)
        })
    }

    /// Fail every clone stuck in `cloning` longer than the threshold
    pub fn sweep_stale(&self) -> Result<Vec<PathBuf>> {
        self.sweep_stale_at(Utc::now())
    }

    /// [`Self::sweep_stale`] with an explicit clock
    pub fn sweep_stale_at(&self, now: DateTime<Utc>) -> Result<Vec<PathBuf>> {
        let stale_after = self.stale_after;
        let resolver = &self.resolver;
        let message = format!("no completion within {}s; presumed dead", stale_after.as_secs());

        let swept = self.store.update(|index| {
            let stale = stale_clones(index, now, stale_after);
            for path in &stale {
                if let Some(entry) = index.get_mut(path) {
                    entry.mark_clone_failed(now, message.as_str());
                }
                remove_entry_dirs(resolver, path);
            }
            Ok(stale)
        })?;

        for path in &swept {
            tracing::warn!(path = %path.display(), "Stale clone marked failed");
            if let Some(task) = self.owned.lock().remove(path) {
                task.abort();
            }
        }
        Ok(swept)
    }

    /// Release in-place updates held longer than the threshold
    pub fn sweep_stale_updates(&self) -> Result<Vec<PathBuf>> {
        self.sweep_stale_updates_at(Utc::now())
    }

    /// [`Self::sweep_stale_updates`] with an explicit clock
    pub fn sweep_stale_updates_at(&self, now: DateTime<Utc>) -> Result<Vec<PathBuf>> {
        let stale_after = self.stale_after;
        let message = format!(
            "working copy update did not finish within {}s; rebuild required",
            stale_after.as_secs()
        );

        let swept = self.store.update(|index| {
            let mut swept = Vec::new();
            for entry in index.entries_mut() {
                let Some(update) = &entry.update else {
                    continue;
                };
                let stale = now
                    .signed_duration_since(update.started_at)
                    .to_std()
                    .map(|age| age > stale_after)
                    .unwrap_or(false);
                if stale && entry.abandon_update(now, message.as_str()) {
                    swept.push(entry.path.clone());
                }
            }
            Ok(swept)
        })?;

        for path in &swept {
            tracing::warn!(path = %path.display(), "Stale working copy update released");
            self.updating.lock().remove(path);
        }
        Ok(swept)
    }

    /// Release every in-place update this process holds, failing the
    /// affected builds. Returns the number of entries changed.
    pub fn release_updates(&self) -> Result<usize> {
        let paths: Vec<PathBuf> = self.updating.lock().drain().collect();
        if paths.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let released = self.store.update(|index| {
            let mut released = 0;
            for path in &paths {
                if let Some(entry) = index.get_mut(path) {
                    if entry.abandon_update(now, SHUTDOWN_REASON) {
                        released += 1;
                    }
                }
            }
            Ok(released)
        })?;
        tracing::info!(released, "Working copy updates interrupted by shutdown");
        Ok(released)
    }

    /// Abort every clone this process drives and mark it failed.
    ///
    /// Returns the number of entries whose state was changed.
    pub fn shutdown(&self) -> Result<usize> {
        let owned: Vec<(PathBuf, AbortHandle)> = self.owned.lock().drain().collect();
        if owned.is_empty() {
            return Ok(0);
        }
        let paths: Vec<PathBuf> = owned
            .into_iter()
            .map(|(path, task)| {
                task.abort();
                path
            })
            .collect();

        let marked = self.fail_clones(&paths, Utc::now(), SHUTDOWN_REASON)?;
        tracing::info!(stopped = paths.len(), marked, "Clones interrupted by shutdown");
        Ok(marked)
    }
}

fn materialize_for(kind: SourceKind, source: &str) -> Materialize {
    match kind {
        SourceKind::Remote => Materialize::Git,
        SourceKind::Local if Path::new(source).join(".git").exists() => Materialize::Git,
        SourceKind::Local => Materialize::Copy,
    }
}

fn stale_clones(index: &CacheIndex, now: DateTime<Utc>, stale_after: Duration) -> Vec<PathBuf> {
    index
        .entries()
        .filter(|e| e.clone_status.state == CloneState::Cloning)
        .filter(|e| match e.clone_status.started_at {
            Some(started) => now
                .signed_duration_since(started)
                .to_std()
                .map(|age| age > stale_after)
                .unwrap_or(false),
            None => true,
        })
        .map(|e| e.path.clone())
        .collect()
}
