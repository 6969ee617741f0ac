//! Code-map build orchestration
//!
//! A build runs the external engine over a cloned working copy in the
//! background. Each attempt gets a fresh `build_id` and its own artifact
//! directory (`builds/<key>/<build_id>/`); results are written back to the
//! metadata store only while that attempt is still the current one, so a
//! late-finishing superseded or swept attempt can never overwrite newer
//! state.
//!
//! Builds left in `building` by a crashed process are recovered by
//! [`BuildOrchestrator::sweep_stale`], which fails any attempt older than
//! the staleness threshold.

mod engine;
mod registry;

pub use engine::{BuildRequest, CommandEngine, FileSelector, GitignoreSelector, MapEngine};
pub use registry::BuildRegistry;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CacheError, Result};
use crate::fs_utils;
use crate::key::KeyResolver;
use crate::metadata::{BuildState, BuildStatus, CacheEntry, MetadataStore, SHUTDOWN_REASON};
use crate::process::ProcessRunner;

/// File list handed to the engine, inside the attempt directory
pub const FILES_LIST: &str = "files.txt";

/// Engine artifact, inside the attempt directory
pub const MAP_FILE: &str = "repo_map.txt";

/// Result of a build request
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// A new attempt was launched
    Started(BuildStatus),
    /// An attempt is already running; nothing was launched
    AlreadyBuilding(BuildStatus),
}

impl BuildOutcome {
    pub fn status(&self) -> &BuildStatus {
        match self {
            BuildOutcome::Started(status) | BuildOutcome::AlreadyBuilding(status) => status,
        }
    }

    pub fn started(&self) -> bool {
        matches!(self, BuildOutcome::Started(_))
    }
}

/// One attempt, as seen by the task driving it
#[derive(Debug, Clone)]
struct BuildJob {
    path: PathBuf,
    build_id: Uuid,
    dir: PathBuf,
    output: PathBuf,
}

/// Launches, tracks and recovers code-map builds
pub struct BuildOrchestrator {
    store: Arc<MetadataStore>,
    resolver: KeyResolver,
    runner: ProcessRunner,
    engine: Arc<dyn MapEngine>,
    selector: Arc<dyn FileSelector>,
    registry: Arc<BuildRegistry>,
    stale_after: Duration,
}

impl BuildOrchestrator {
    pub fn new(
        store: Arc<MetadataStore>,
        resolver: KeyResolver,
        runner: ProcessRunner,
        engine: Arc<dyn MapEngine>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            runner,
            engine,
            selector: Arc::new(GitignoreSelector::default()),
            registry: Arc::new(BuildRegistry::new()),
            stale_after,
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn FileSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_registry(mut self, registry: Arc<BuildRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<BuildRegistry> {
        &self.registry
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Start a build for a cloned entry.
    ///
    /// Idempotent while an attempt is running: the running attempt's status
    /// is returned and nothing new is launched. Must be called from within a
    /// tokio runtime.
    pub fn start_build(self: &Arc<Self>, path: &Path) -> Result<BuildOutcome> {
        let build_id = Uuid::new_v4();
        let dir = self
            .resolver
            .build_dir_for(path)
            .join(build_id.to_string());
        let output = dir.join(MAP_FILE);
        let now = Utc::now();

        let outcome = self.store.update(|index| {
            let entry = index.get_mut(path).ok_or_else(|| CacheError::NotFound {
                path: path.to_path_buf(),
            })?;
            if entry.build_status.state == BuildState::Building {
                return Ok(BuildOutcome::AlreadyBuilding(entry.build_status.clone()));
            }
            if entry.is_updating() {
                return Err(CacheError::AlreadyInProgress {
                    path: path.to_path_buf(),
                });
            }
            if !entry.begin_build(now, build_id, output.clone()) {
                return Err(CacheError::NotReady {
                    path: path.to_path_buf(),
                    reason: format!("clone is {}", entry.clone_status.state.as_str()),
                });
            }
            Ok(BuildOutcome::Started(entry.build_status.clone()))
        })?;

        if let BuildOutcome::Started(_) = &outcome {
            tracing::info!(path = %path.display(), %build_id, "Build started");
            self.registry.register(path, build_id);

            let job = BuildJob {
                path: path.to_path_buf(),
                build_id,
                dir,
                output,
            };
            let task = tokio::spawn(Arc::clone(self).run(job));
            self.registry.attach_task(path, build_id, task.abort_handle());
        }
        Ok(outcome)
    }

    /// Current build status of an entry. Pure read.
    pub fn status(&self, path: &Path) -> Result<Option<BuildStatus>> {
        Ok(self
            .store
            .read()?
            .get(path)
            .map(|entry| entry.build_status.clone()))
    }

    /// Fail every build that has been `building` longer than the threshold
    pub fn sweep_stale(&self) -> Result<Vec<PathBuf>> {
        self.sweep_stale_at(Utc::now())
    }

    /// [`Self::sweep_stale`] with an explicit clock
    pub fn sweep_stale_at(&self, now: DateTime<Utc>) -> Result<Vec<PathBuf>> {
        let stale_after = self.stale_after;
        let swept = self.store.update(|index| {
            let mut swept = Vec::new();
            for entry in index.entries_mut() {
                if entry.build_status.state != BuildState::Building {
                    continue;
                }
                if !is_stale(entry.build_status.started_at, now, stale_after) {
                    continue;
                }
                let message = format!(
                    "no completion within {}s; presumed dead",
                    stale_after.as_secs()
                );
                swept.push((entry.path.clone(), entry.build_status.build_id));
                fail_presumed_dead(entry, now, message);
            }
            Ok(swept)
        })?;

        for (path, build_id) in &swept {
            tracing::warn!(path = %path.display(), build_id = ?build_id, "Stale build marked failed");
            if let Some(build_id) = build_id {
                self.registry.stop(path, *build_id);
            }
        }
        Ok(swept.into_iter().map(|(path, _)| path).collect())
    }

    /// Stop every build this process owns and mark it failed.
    ///
    /// Returns the number of entries whose state was changed.
    pub fn shutdown(&self) -> Result<usize> {
        let owned = self.registry.drain();
        if owned.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let marked = self.store.update(|index| {
            let mut marked = 0;
            for (path, build_id) in &owned {
                if let Some(entry) = index.get_mut(path) {
                    if entry.fail_build(*build_id, now, SHUTDOWN_REASON) {
                        marked += 1;
                    }
                }
            }
            Ok(marked)
        })?;

        tracing::info!(stopped = owned.len(), marked, "Builds interrupted by shutdown");
        Ok(marked)
    }

    async fn run(self: Arc<Self>, job: BuildJob) {
        let result = self.execute(&job).await;
        let now = Utc::now();
        let build_id = job.build_id;

        let recorded = match &result {
            Ok(()) => self.store.update(|index| {
                Ok(index
                    .get_mut(&job.path)
                    .map(|e| e.complete_build(build_id, now))
                    .unwrap_or(false))
            }),
            Err(e) => {
                let message = failure_text(e);
                self.store.update(|index| {
                    Ok(index
                        .get_mut(&job.path)
                        .map(|e| e.fail_build(build_id, now, message))
                        .unwrap_or(false))
                })
            }
        };

        match (&result, recorded) {
            (Ok(()), Ok(true)) => {
                tracing::info!(path = %job.path.display(), %build_id, "Build complete");
                self.prune_previous_builds(&job).await;
            }
            (Err(e), Ok(true)) => {
                tracing::warn!(path = %job.path.display(), %build_id, "Build failed: {}", e);
            }
            (_, Ok(false)) => {
                tracing::info!(
                    path = %job.path.display(),
                    %build_id,
                    "Build result discarded; attempt is no longer current"
                );
            }
            (_, Err(e)) => {
                tracing::error!(path = %job.path.display(), %build_id, "Failed to record build result: {}", e);
            }
        }
        self.registry.release(&job.path, build_id);
    }

    async fn execute(&self, job: &BuildJob) -> Result<()> {
        tokio::fs::create_dir_all(&job.dir).await?;

        let selector = Arc::clone(&self.selector);
        let root = job.path.clone();
        let files = tokio::task::spawn_blocking(move || selector.select(&root))
            .await
            .map_err(|e| CacheError::BuildFailed {
                message: format!("file selection did not finish: {}", e),
            })??;
        if files.is_empty() {
            return Err(CacheError::BuildFailed {
                message: "no source files to map".to_string(),
            });
        }

        let mut listing = String::new();
        for file in &files {
            listing.push_str(&file.to_string_lossy());
            listing.push('\n');
        }
        let files_list = job.dir.join(FILES_LIST);
        tokio::fs::write(&files_list, listing).await?;

        let request = BuildRequest {
            build_id: job.build_id,
            root: job.path.clone(),
            files_list,
            output: job.output.clone(),
        };
        let command = self.engine.command(&request);
        let process = self.runner.run_background(&command)?;

        let pid = process.pid();
        if let Some(kill) = process.kill_handle() {
            self.registry.attach_process(&job.path, job.build_id, kill);
        }
        self.store.update(|index| {
            Ok(index
                .get_mut(&job.path)
                .map(|e| e.set_build_process(job.build_id, pid)))
        })?;
        tracing::debug!(path = %job.path.display(), build_id = %job.build_id, pid = ?pid, "Engine running");

        let output = process.wait_timeout(self.stale_after).await?;
        if !output.success() {
            return Err(CacheError::BuildFailed {
                message: format!("{} {}", command.program(), output.error_text()),
            });
        }

        let produced = tokio::fs::try_exists(&job.output).await.unwrap_or(false);
        if !produced {
            // Engines that print the map instead of writing it.
            if output.stdout.trim().is_empty() {
                return Err(CacheError::BuildFailed {
                    message: format!("{} exited successfully but produced no map", command.program()),
                });
            }
            fs_utils::write_atomic(&job.output, output.stdout.as_bytes())?;
        }
        Ok(())
    }

    /// Remove artifact directories of earlier attempts for the same entry
    async fn prune_previous_builds(&self, job: &BuildJob) {
        let Some(parent) = job.dir.parent().map(Path::to_path_buf) else {
            return;
        };
        let store = Arc::clone(&self.store);
        let path = job.path.clone();
        let keep = job.build_id;
        let result = tokio::task::spawn_blocking(move || -> Result<()> {
            // A newer attempt may have started since this one finished.
            let current = store.read()?.get(&path).and_then(|e| e.build_status.build_id);
            for entry in std::fs::read_dir(&parent)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                let Ok(id) = Uuid::parse_str(&name) else {
                    continue;
                };
                if id != keep && Some(id) != current {
                    fs_utils::remove_tree(&entry.path())?;
                }
            }
            Ok(())
        })
        .await;
        if let Ok(Err(e)) = result {
            tracing::debug!(path = %job.path.display(), "Could not prune old build artifacts: {}", e);
        }
    }
}

fn is_stale(started_at: Option<DateTime<Utc>>, now: DateTime<Utc>, stale_after: Duration) -> bool {
    match started_at {
        Some(started) => now
            .signed_duration_since(started)
            .to_std()
            .map(|age| age > stale_after)
            .unwrap_or(false),
        None => true,
    }
}

fn fail_presumed_dead(entry: &mut CacheEntry, now: DateTime<Utc>, message: String) {
    match entry.build_status.build_id {
        Some(build_id) => {
            entry.fail_build(build_id, now, message);
        }
        None => {
            entry.build_status.state = BuildState::Failed;
            entry.build_status.completed_at = Some(now);
            entry.build_status.error = Some(message);
        }
    }
}

/// Text stored in `BuildStatus::error`
fn failure_text(error: &CacheError) -> String {
    match error {
        CacheError::BuildFailed { message } => message.clone(),
        other => other.to_string(),
    }
}
