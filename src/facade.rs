//! Single entry point composing the cache components
//!
//! Callers resolve a source to a working copy, ask for it to be built, and
//! poll status. Long work (clone, build) always runs in the background; the
//! facade returns as soon as the request is accepted. Every read that serves
//! content is gated on the entry's lifecycle state and reports "not ready"
//! distinctly from "failed".

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::build::{
    BuildOrchestrator, BuildOutcome, CommandEngine, FileSelector, GitignoreSelector, MapEngine,
};
use crate::clone::CloneOrchestrator;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::eviction::{EvictionManager, EvictionReport};
use crate::fs_utils;
use crate::git::{GitCli, VersionControl};
use crate::key::{self, CacheStrategy, KeyResolver, SourceKind};
use crate::metadata::{BuildState, BuildStatus, CacheEntry, CloneState, MetadataStore};
use crate::process::ProcessRunner;

const BACKGROUND_POLL: std::time::Duration = std::time::Duration::from_millis(200);

/// Coarse lifecycle position of an entry, derived from its two state machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Cloning,
    CloneFailed,
    /// Working copy present, no build yet
    Cloned,
    Building,
    BuildFailed,
    /// Working copy is being checked out or refreshed in place
    Updating,
    /// Working copy and map both available
    Ready,
}

impl Readiness {
    pub fn of(entry: &CacheEntry) -> Self {
        match entry.clone_status.state {
            CloneState::NotStarted | CloneState::Cloning => Readiness::Cloning,
            CloneState::Failed => Readiness::CloneFailed,
            CloneState::Cloned if entry.is_updating() => Readiness::Updating,
            CloneState::Cloned => match entry.build_status.state {
                BuildState::NotStarted => Readiness::Cloned,
                BuildState::Building => Readiness::Building,
                BuildState::Complete => Readiness::Ready,
                BuildState::Failed => Readiness::BuildFailed,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Readiness::Cloning => "cloning",
            Readiness::CloneFailed => "clone_failed",
            Readiness::Cloned => "cloned",
            Readiness::Building => "building",
            Readiness::BuildFailed => "build_failed",
            Readiness::Updating => "updating",
            Readiness::Ready => "ready",
        }
    }

    /// No further progress will happen without a new request
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Readiness::CloneFailed | Readiness::BuildFailed | Readiness::Ready
        )
    }
}

/// An entry plus its derived readiness
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryStatus {
    #[serde(flatten)]
    pub entry: CacheEntry,
    pub readiness: Readiness,
}

impl From<CacheEntry> for EntryStatus {
    fn from(entry: CacheEntry) -> Self {
        let readiness = Readiness::of(&entry);
        Self { entry, readiness }
    }
}

/// Content read from a working copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileContent {
    File { text: String },
    /// Child names, directories suffixed with `/`
    Directory { entries: Vec<String> },
}

/// Result of a gated read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReadOutcome<T> {
    Ready { content: T },
    /// Work is still in progress; retry later
    NotReady { readiness: Readiness, reason: String },
    /// The entry reached a failed terminal state
    Failed { error: String },
}

impl<T> ReadOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadOutcome::Ready { .. })
    }
}

/// Entries reclassified by one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub builds: Vec<PathBuf>,
    pub clones: Vec<PathBuf>,
    /// In-place updates whose owner is gone
    pub updates: Vec<PathBuf>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.builds.is_empty() && self.clones.is_empty() && self.updates.is_empty()
    }
}

/// Work abandoned by [`CacheFacade::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub clones: usize,
    pub builds: usize,
    pub updates: usize,
}

/// Assembles a [`CacheFacade`], with seams for the external collaborators
pub struct CacheFacadeBuilder {
    config: CacheConfig,
    vcs: Option<Arc<dyn VersionControl>>,
    engine: Option<Arc<dyn MapEngine>>,
    selector: Option<Arc<dyn FileSelector>>,
}

impl CacheFacadeBuilder {
    pub fn vcs(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn MapEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn selector(mut self, selector: Arc<dyn FileSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn build(self) -> Result<Arc<CacheFacade>> {
        let config = self.config;
        config.validate()?;

        let root = config.cache_root();
        let store = Arc::new(MetadataStore::open(&root)?);
        let resolver = KeyResolver::new(&root);
        let runner = ProcessRunner::new().with_passthrough_env(config.passthrough_env.clone());

        let vcs = self.vcs.unwrap_or_else(|| {
            Arc::new(GitCli::new(
                runner.clone(),
                config.clone_timeout(),
                config.git_timeout(),
            ))
        });
        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(CommandEngine::from_config(&config.engine)));
        let selector = self
            .selector
            .unwrap_or_else(|| Arc::new(GitignoreSelector::default()));

        let builds = Arc::new(
            BuildOrchestrator::new(
                Arc::clone(&store),
                resolver.clone(),
                runner,
                engine,
                config.build_stale_after(),
            )
            .with_selector(selector),
        );
        let clones = Arc::new(CloneOrchestrator::new(
            Arc::clone(&store),
            resolver.clone(),
            vcs,
            Arc::clone(&builds),
            config.clone_stale_after(),
        ));
        let eviction = EvictionManager::new(Arc::clone(&store), resolver.clone());

        tracing::debug!(root = %root.display(), max_entries = config.max_entries, "Cache opened");
        Ok(Arc::new(CacheFacade {
            config,
            store,
            resolver,
            clones,
            builds,
            eviction,
            sweeper: Mutex::new(None),
        }))
    }
}

/// Composition root for the repository cache
pub struct CacheFacade {
    config: CacheConfig,
    store: Arc<MetadataStore>,
    resolver: KeyResolver,
    clones: Arc<CloneOrchestrator>,
    builds: Arc<BuildOrchestrator>,
    eviction: EvictionManager,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CacheFacade {
    pub fn builder(config: CacheConfig) -> CacheFacadeBuilder {
        CacheFacadeBuilder {
            config,
            vcs: None,
            engine: None,
            selector: None,
        }
    }

    /// Facade with the default git and engine collaborators
    pub fn open(config: CacheConfig) -> Result<Arc<Self>> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Working-copy path a request maps to, without touching any state
    pub fn path_for(
        &self,
        source: &str,
        branch: Option<&str>,
        strategy: Option<CacheStrategy>,
    ) -> Result<PathBuf> {
        let source = self.canonical_source(source)?;
        let strategy = strategy.unwrap_or(self.config.default_strategy);
        Ok(self.resolver.resolve(&source, branch, strategy))
    }

    /// Return the entry for a source, launching a clone if it is absent.
    ///
    /// Never waits for the clone; poll [`Self::status`] for progress.
    pub async fn resolve(
        &self,
        source: &str,
        branch: Option<&str>,
        strategy: Option<CacheStrategy>,
    ) -> Result<EntryStatus> {
        let source = self.canonical_source(source)?;
        let strategy = strategy.unwrap_or(self.config.default_strategy);

        let outcome = self.clones.start(&source, branch, strategy).await?;
        let created = matches!(outcome, crate::clone::CloneOutcome::Started(_));
        if created {
            self.enforce_limit_logged();
        }
        Ok(outcome.into_entry().into())
    }

    /// Make sure a map exists or is being built for a cloned entry.
    ///
    /// Idempotent: a complete build whose artifact is present is returned
    /// unchanged, and a running build is never duplicated.
    pub async fn ensure_built(&self, path: &Path) -> Result<BuildStatus> {
        let entry = self.require_entry(path)?;
        match entry.clone_status.state {
            // The build starts by itself once the clone finishes.
            CloneState::NotStarted | CloneState::Cloning => return Ok(entry.build_status),
            CloneState::Failed => {
                return Err(CacheError::NotReady {
                    path: path.to_path_buf(),
                    reason: format!(
                        "clone failed: {}",
                        entry.clone_status.error.unwrap_or_default()
                    ),
                })
            }
            CloneState::Cloned => {}
        }
        // The update starts a build of its own once it finishes.
        if entry.is_updating() {
            return Ok(entry.build_status);
        }

        match entry.build_status.state {
            BuildState::Building => return Ok(entry.build_status),
            BuildState::Complete if artifact_present(&entry.build_status) => {
                self.touch(path)?;
                return Ok(entry.build_status);
            }
            _ => {}
        }

        // Serialize with in-place checkouts of the same working copy.
        let lock = self.clones.entry_lock(path);
        let _guard = lock.lock().await;
        let status = match self.builds.start_build(path)? {
            BuildOutcome::Started(status) | BuildOutcome::AlreadyBuilding(status) => status,
        };
        self.touch(path)?;
        Ok(status)
    }

    /// Current status of an entry; runs the staleness sweeps first
    pub fn status(&self, path: &Path) -> Result<EntryStatus> {
        self.sweep()?;
        Ok(self.require_entry(path)?.into())
    }

    /// Record a use of an entry and enforce the capacity limit
    pub fn touch(&self, path: &Path) -> Result<EvictionReport> {
        let now = chrono::Utc::now();
        self.store.update(|index| {
            let entry = index.get_mut(path).ok_or_else(|| CacheError::NotFound {
                path: path.to_path_buf(),
            })?;
            entry.touch(now);
            Ok(())
        })?;
        self.eviction.enforce_limit(self.config.max_entries)
    }

    /// Bring a cloned working copy up to date and rebuild its map.
    ///
    /// Git working copies are fast-forwarded; copied local directories are
    /// copied again. A failed update leaves the entry as it was.
    pub async fn refresh(&self, path: &Path) -> Result<BuildOutcome> {
        self.clones.refresh(path).await?;
        self.builds.start_build(path)
    }

    /// Remote branch names of a cloned git entry
    pub async fn list_branches(&self, path: &Path) -> Result<Vec<String>> {
        let entry = self.require_entry(path)?;
        if !entry.is_cloned() {
            return Err(CacheError::NotReady {
                path: path.to_path_buf(),
                reason: format!("clone is {}", entry.clone_status.state.as_str()),
            });
        }
        self.clones.vcs().list_branches(path).await
    }

    /// Read a file or list a directory inside a cloned working copy
    pub fn read_file(&self, path: &Path, relative: &Path) -> Result<ReadOutcome<FileContent>> {
        let entry = self.require_entry(path)?;
        match entry.clone_status.state {
            CloneState::Cloned => {}
            CloneState::Failed => {
                return Ok(ReadOutcome::Failed {
                    error: entry.clone_status.error.unwrap_or_default(),
                })
            }
            CloneState::NotStarted | CloneState::Cloning => {
                return Ok(ReadOutcome::NotReady {
                    readiness: Readiness::Cloning,
                    reason: "working copy is still being cloned".to_string(),
                })
            }
        }
        if let Some(update) = &entry.update {
            return Ok(ReadOutcome::NotReady {
                readiness: Readiness::Updating,
                reason: format!("working copy {} in progress", update.kind.as_str()),
            });
        }

        let target = contained_path(path, relative)?;
        let content = if target.is_dir() {
            let mut entries = Vec::new();
            for child in fs::read_dir(&target)? {
                let child = child?;
                let name = child.file_name().to_string_lossy().to_string();
                if name == ".git" {
                    continue;
                }
                if child.file_type()?.is_dir() {
                    entries.push(format!("{}/", name));
                } else {
                    entries.push(name);
                }
            }
            entries.sort();
            FileContent::Directory { entries }
        } else {
            let bytes = fs::read(&target)?;
            FileContent::File {
                text: String::from_utf8_lossy(&bytes).into_owned(),
            }
        };

        self.touch(path)?;
        Ok(ReadOutcome::Ready { content })
    }

    /// The code map of an entry, once its build is complete
    pub fn read_map(&self, path: &Path) -> Result<ReadOutcome<String>> {
        let entry = self.require_entry(path)?;
        let readiness = Readiness::of(&entry);
        let outcome = match readiness {
            Readiness::CloneFailed => ReadOutcome::Failed {
                error: entry.clone_status.error.unwrap_or_default(),
            },
            Readiness::BuildFailed => ReadOutcome::Failed {
                error: entry.build_status.error.unwrap_or_default(),
            },
            Readiness::Cloning
            | Readiness::Cloned
            | Readiness::Building
            | Readiness::Updating => {
                ReadOutcome::NotReady {
                    readiness,
                    reason: format!("map is not built yet ({})", readiness.as_str()),
                }
            }
            Readiness::Ready => match &entry.build_status.output_location {
                Some(output) if output.is_file() => {
                    let map = fs::read_to_string(output)?;
                    self.touch(path)?;
                    ReadOutcome::Ready { content: map }
                }
                _ => ReadOutcome::Failed {
                    error: "map artifact is missing; rebuild the entry".to_string(),
                },
            },
        };
        Ok(outcome)
    }

    /// All entries, most recently used first
    pub fn list(&self) -> Result<Vec<EntryStatus>> {
        let index = self.store.read()?;
        let mut entries: Vec<CacheEntry> = index.entries().cloned().collect();
        entries.sort_by(|a, b| {
            b.last_access
                .cmp(&a.last_access)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(entries.into_iter().map(EntryStatus::from).collect())
    }

    /// Explicitly evict one non-busy entry
    pub fn remove(&self, path: &Path) -> Result<CacheEntry> {
        self.eviction.remove(path)
    }

    /// Run eviction against the configured limit now
    pub fn evict(&self) -> Result<EvictionReport> {
        self.eviction.enforce_limit(self.config.max_entries)
    }

    /// Reclassify stale builds and clones now
    pub fn sweep(&self) -> Result<SweepReport> {
        Ok(SweepReport {
            builds: self.builds.sweep_stale()?,
            clones: self.clones.sweep_stale()?,
            updates: self.clones.sweep_stale_updates()?,
        })
    }

    /// Start the periodic background sweep; replaces a running one
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let facade: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(facade) = facade.upgrade() else {
                    break;
                };
                if let Err(e) = facade.sweep() {
                    tracing::warn!("Background sweep failed: {}", e);
                }
                facade.enforce_limit_logged();
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Whether this process still drives a clone or build
    pub fn has_background_work(&self) -> bool {
        self.clones.owned_count() > 0 || !self.builds.registry().is_empty()
    }

    /// Wait until the clones and builds this process launched have finished
    pub async fn wait_for_background(&self) {
        while self.has_background_work() {
            tokio::time::sleep(BACKGROUND_POLL).await;
        }
    }

    /// Stop background work owned by this process and mark it failed.
    ///
    /// Call from the host's graceful-termination path.
    pub fn shutdown(&self) -> Result<ShutdownReport> {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        let report = ShutdownReport {
            clones: self.clones.shutdown()?,
            builds: self.builds.shutdown()?,
            updates: self.clones.release_updates()?,
        };
        tracing::info!(
            clones = report.clones,
            builds = report.builds,
            updates = report.updates,
            "Cache shut down"
        );
        Ok(report)
    }

    /// Discard all cache state: metadata (moved aside if present) plus every
    /// working copy and artifact. For operator recovery from a corrupt store.
    pub fn reset(&self) -> Result<Option<PathBuf>> {
        let backup = self.store.reinitialize()?;
        fs_utils::remove_tree(&self.resolver.repos_dir())?;
        fs_utils::remove_tree(&self.resolver.builds_dir())?;
        tracing::warn!(root = %self.root().display(), "Cache reset");
        Ok(backup)
    }

    fn require_entry(&self, path: &Path) -> Result<CacheEntry> {
        self.store
            .read()?
            .get(path)
            .cloned()
            .ok_or_else(|| CacheError::NotFound {
                path: path.to_path_buf(),
            })
    }

    fn enforce_limit_logged(&self) {
        if let Err(e) = self.eviction.enforce_limit(self.config.max_entries) {
            tracing::warn!("Eviction failed: {}", e);
        }
    }

    /// Validate a source and, for local paths, make it absolute and canonical
    fn canonical_source(&self, source: &str) -> Result<String> {
        match key::validate_source(source)? {
            SourceKind::Remote => Ok(key::normalize_source(source)),
            SourceKind::Local => {
                let raw = source.trim();
                let canonical = fs::canonicalize(raw).map_err(|e| {
                    CacheError::invalid_source(source, format!("cannot access path: {}", e))
                })?;
                if !canonical.is_dir() {
                    return Err(CacheError::invalid_source(source, "not a directory"));
                }
                Ok(fs_utils::normalize_path(&canonical)
                    .to_string_lossy()
                    .into_owned())
            }
        }
    }
}

fn artifact_present(status: &BuildStatus) -> bool {
    status
        .output_location
        .as_ref()
        .map(|p| p.is_file())
        .unwrap_or(false)
}

/// Join `relative` onto `root`, refusing anything that escapes it
fn contained_path(root: &Path, relative: &Path) -> Result<PathBuf> {
    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir));
    let outside = || {
        CacheError::invalid_source(
            relative.to_string_lossy(),
            "path must stay inside the working copy",
        )
    };
    if escapes {
        return Err(outside());
    }

    let joined = root.join(relative);
    let canonical_root = fs::canonicalize(root)?;
    let canonical = fs::canonicalize(&joined).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CacheError::NotFound {
                path: joined.clone(),
            }
        } else {
            e.into()
        }
    })?;
    // Symlinks may still point outside.
    if !canonical.starts_with(&canonical_root) {
        return Err(outside());
    }
    Ok(canonical)
}
