//! Durable cache metadata
//!
//! Every cache entry and its clone/build lifecycle lives in a single JSON
//! document under the cache root. All access goes through
//! [`MetadataStore::read`] and [`MetadataStore::update`], which hold both an
//! in-process mutex and an OS-level exclusive lock on `metadata.lock`, so
//! mutations are serialized across threads and across processes.
//!
//! Writes go to a temp file that is renamed over `metadata.json`; a crash
//! leaves either the previous document or the new one, never a mix.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CacheError, Result};
use crate::fs_utils;
use crate::key::CacheStrategy;

/// Current on-disk document version
pub const METADATA_VERSION: u32 = 1;

/// Error recorded on work this process abandons when it shuts down
pub const SHUTDOWN_REASON: &str = "interrupted by shutdown";

const METADATA_FILE: &str = "metadata.json";
const LOCK_FILE: &str = "metadata.lock";

// ============================================================================
// Lifecycle states
// ============================================================================

/// Clone lifecycle: `not_started -> cloning -> cloned | failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneState {
    #[default]
    NotStarted,
    Cloning,
    Cloned,
    Failed,
}

impl CloneState {
    /// Whether moving to `next` is a forward transition
    pub fn can_advance_to(self, next: CloneState) -> bool {
        matches!(
            (self, next),
            (CloneState::NotStarted, CloneState::Cloning)
                | (CloneState::Cloning, CloneState::Cloned)
                | (CloneState::Cloning, CloneState::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloneState::NotStarted => "not_started",
            CloneState::Cloning => "cloning",
            CloneState::Cloned => "cloned",
            CloneState::Failed => "failed",
        }
    }
}

/// Build lifecycle per attempt: `not_started -> building -> complete | failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    #[default]
    NotStarted,
    Building,
    Complete,
    Failed,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::NotStarted => "not_started",
            BuildState::Building => "building",
            BuildState::Complete => "complete",
            BuildState::Failed => "failed",
        }
    }
}

/// Clone progress of one entry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneStatus {
    pub state: CloneState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Build progress of one entry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    pub state: BuildState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub build_id: Option<Uuid>,
    /// OS process id of the engine, once spawned
    pub process_handle: Option<u32>,
    pub error: Option<String>,
    pub output_location: Option<PathBuf>,
}

/// In-place change of an existing working copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// Shared working copy switched to another ref
    Checkout,
    /// Working copy brought up to date with its source
    Refresh,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::Checkout => "checkout",
            UpdateKind::Refresh => "refresh",
        }
    }
}

/// Marker persisted while a working copy is changed in place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingCopyUpdate {
    pub kind: UpdateKind,
    pub started_at: DateTime<Utc>,
}

// ============================================================================
// Cache entry
// ============================================================================

/// One working copy and its lifecycle record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Working-copy location; primary key
    pub path: PathBuf,
    pub source_location: String,
    /// Requested ref; for `shared` entries, the ref currently checked out
    pub branch: Option<String>,
    pub cache_strategy: CacheStrategy,
    pub last_access: DateTime<Utc>,
    pub clone_status: CloneStatus,
    pub build_status: BuildStatus,
    /// Set while a checkout or refresh rewrites the working copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<WorkingCopyUpdate>,
}

impl CacheEntry {
    pub fn new(
        path: PathBuf,
        source_location: String,
        branch: Option<String>,
        cache_strategy: CacheStrategy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            path,
            source_location,
            branch,
            cache_strategy,
            last_access: now,
            clone_status: CloneStatus::default(),
            build_status: BuildStatus::default(),
            update: None,
        }
    }

    /// Clone, build or in-place update work is in flight
    pub fn is_busy(&self) -> bool {
        self.clone_status.state == CloneState::Cloning
            || self.build_status.state == BuildState::Building
            || self.is_updating()
    }

    /// May be removed by eviction
    pub fn is_evictable(&self) -> bool {
        !self.is_updating()
            && matches!(self.clone_status.state, CloneState::Cloned | CloneState::Failed)
            && matches!(
                self.build_status.state,
                BuildState::NotStarted | BuildState::Complete | BuildState::Failed
            )
    }

    /// Working copy is present and usable
    pub fn is_cloned(&self) -> bool {
        self.clone_status.state == CloneState::Cloned
    }

    /// A checkout or refresh is rewriting the working copy
    pub fn is_updating(&self) -> bool {
        self.update.is_some()
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_access {
            self.last_access = now;
        }
    }

    // ========== Clone transitions ==========

    /// `not_started -> cloning`
    pub fn mark_cloning(&mut self, now: DateTime<Utc>) -> bool {
        if !self.clone_status.state.can_advance_to(CloneState::Cloning) {
            return false;
        }
        self.clone_status = CloneStatus {
            state: CloneState::Cloning,
            started_at: Some(now),
            completed_at: None,
            error: None,
        };
        true
    }

    /// `cloning -> cloned`
    pub fn mark_cloned(&mut self, now: DateTime<Utc>) -> bool {
        if !self.clone_status.state.can_advance_to(CloneState::Cloned) {
            return false;
        }
        self.clone_status.state = CloneState::Cloned;
        self.clone_status.completed_at = Some(now);
        self.clone_status.error = None;
        true
    }

    /// `cloning -> failed`
    pub fn mark_clone_failed(&mut self, now: DateTime<Utc>, error: impl Into<String>) -> bool {
        if !self.clone_status.state.can_advance_to(CloneState::Failed) {
            return false;
        }
        self.clone_status.state = CloneState::Failed;
        self.clone_status.completed_at = Some(now);
        self.clone_status.error = Some(error.into());
        true
    }

    // ========== In-place updates ==========

    /// Claim the working copy for an in-place update.
    ///
    /// Refused unless the entry is cloned and otherwise idle.
    pub fn begin_update(&mut self, now: DateTime<Utc>, kind: UpdateKind) -> bool {
        if !self.is_cloned() || self.is_busy() {
            return false;
        }
        self.update = Some(WorkingCopyUpdate {
            kind,
            started_at: now,
        });
        true
    }

    /// Release the working copy after an update, whatever its result
    pub fn finish_update(&mut self) -> bool {
        self.update.take().is_some()
    }

    /// Drop an update whose owner is gone.
    ///
    /// The working copy may no longer match the recorded map, so the build
    /// is failed and the next request rebuilds.
    pub fn abandon_update(&mut self, now: DateTime<Utc>, error: impl Into<String>) -> bool {
        if !self.finish_update() {
            return false;
        }
        self.build_status = BuildStatus {
            state: BuildState::Failed,
            completed_at: Some(now),
            error: Some(error.into()),
            ..BuildStatus::default()
        };
        true
    }

    // ========== Build transitions ==========

    /// Start a fresh build attempt. Refused while a build is running or the
    /// working copy is being updated.
    pub fn begin_build(
        &mut self,
        now: DateTime<Utc>,
        build_id: Uuid,
        output_location: PathBuf,
    ) -> bool {
        if self.build_status.state == BuildState::Building
            || !self.is_cloned()
            || self.is_updating()
        {
            return false;
        }
        self.build_status = BuildStatus {
            state: BuildState::Building,
            started_at: Some(now),
            completed_at: None,
            build_id: Some(build_id),
            process_handle: None,
            error: None,
            output_location: Some(output_location),
        };
        true
    }

    /// Record the engine's process id for the running attempt
    pub fn set_build_process(&mut self, build_id: Uuid, pid: Option<u32>) -> bool {
        if !self.owns_running_build(build_id) {
            return false;
        }
        self.build_status.process_handle = pid;
        true
    }

    /// `building -> complete` for the given attempt only
    pub fn complete_build(&mut self, build_id: Uuid, now: DateTime<Utc>) -> bool {
        if !self.owns_running_build(build_id) {
            return false;
        }
        self.build_status.state = BuildState::Complete;
        self.build_status.completed_at = Some(now);
        self.build_status.error = None;
        true
    }

    /// `building -> failed` for the given attempt only
    pub fn fail_build(&mut self, build_id: Uuid, now: DateTime<Utc>, error: impl Into<String>) -> bool {
        if !self.owns_running_build(build_id) {
            return false;
        }
        self.build_status.state = BuildState::Failed;
        self.build_status.completed_at = Some(now);
        self.build_status.error = Some(error.into());
        true
    }

    /// Forget the previous build result so the next request builds afresh
    pub fn invalidate_build(&mut self) -> bool {
        if self.build_status.state == BuildState::Building {
            return false;
        }
        self.build_status = BuildStatus::default();
        true
    }

    fn owns_running_build(&self, build_id: Uuid) -> bool {
        self.build_status.state == BuildState::Building
            && self.build_status.build_id == Some(build_id)
    }
}

// ============================================================================
// Index document
// ============================================================================

/// The whole persisted document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheIndex {
    pub version: u32,
    #[serde(default)]
    entries: BTreeMap<String, CacheEntry>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

fn index_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl CacheIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&CacheEntry> {
        self.entries.get(&index_key(path))
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut CacheEntry> {
        self.entries.get_mut(&index_key(path))
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(&index_key(path))
    }

    /// Insert or replace the entry stored under its own path
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(index_key(&entry.path), entry)
    }

    pub fn remove(&mut self, path: &Path) -> Option<CacheEntry> {
        self.entries.remove(&index_key(path))
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut CacheEntry> {
        self.entries.values_mut()
    }

    /// Entries that are neither cloning nor building
    pub fn idle_count(&self) -> usize {
        self.entries.values().filter(|e| !e.is_busy()).count()
    }
}

// ============================================================================
// Store
// ============================================================================

/// Holds the OS lock until dropped
struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Lock-protected, atomically replaced metadata document
#[derive(Debug)]
pub struct MetadataStore {
    file: PathBuf,
    lock_file: PathBuf,
    guard: Mutex<()>,
}

impl MetadataStore {
    /// Open (and create the directory for) the store under `root`
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            file: root.join(METADATA_FILE),
            lock_file: root.join(LOCK_FILE),
            guard: Mutex::new(()),
        })
    }

    /// Path of the backing document
    pub fn path(&self) -> &Path {
        &self.file
    }

    /// Consistent snapshot of the whole index
    pub fn read(&self) -> Result<CacheIndex> {
        let _guard = self.guard.lock();
        let _lock = self.acquire()?;
        self.load()
    }

    /// Load, mutate and atomically persist the index in one critical section.
    ///
    /// If the mutator returns an error nothing is written. The document is
    /// only rewritten when the mutator actually changed it.
    pub fn update<R, F>(&self, mutate: F) -> Result<R>
    where
        F: FnOnce(&mut CacheIndex) -> Result<R>,
    {
        let _guard = self.guard.lock();
        let _lock = self.acquire()?;

        let before = self.load()?;
        let mut index = before.clone();
        let result = mutate(&mut index)?;

        if index != before {
            self.persist(&index)?;
        }
        Ok(result)
    }

    /// Replace an unreadable document with an empty one.
    ///
    /// The corrupt file is moved aside (not deleted) for inspection; its new
    /// location is returned.
    pub fn reinitialize(&self) -> Result<Option<PathBuf>> {
        let _guard = self.guard.lock();
        let _lock = self.acquire()?;

        let backup = if self.file.exists() {
            let stamp = Utc::now().format("%Y%m%dT%H%M%S");
            let backup = self
                .file
                .with_file_name(format!("{}.corrupt-{}", METADATA_FILE, stamp));
            fs::rename(&self.file, &backup)?;
            tracing::warn!(backup = %backup.display(), "Moved metadata store aside");
            Some(backup)
        } else {
            None
        };

        self.persist(&CacheIndex::default())?;
        Ok(backup)
    }

    fn acquire(&self) -> Result<StoreLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_file)?;
        FileExt::lock_exclusive(&file)?;
        Ok(StoreLock { file })
    }

    fn load(&self) -> Result<CacheIndex> {
        let bytes = match fs::read(&self.file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CacheIndex::default()),
            Err(e) => return Err(e.into()),
        };

        let index: CacheIndex =
            serde_json::from_slice(&bytes).map_err(|e| CacheError::StoreCorrupt {
                path: self.file.clone(),
                message: e.to_string(),
            })?;

        if index.version > METADATA_VERSION {
            return Err(CacheError::StoreCorrupt {
                path: self.file.clone(),
                message: format!(
                    "unsupported metadata version {} (this build reads up to {})",
                    index.version, METADATA_VERSION
                ),
            });
        }
        Ok(index)
    }

    fn persist(&self, index: &CacheIndex) -> Result<()> {
        let json = serde_json::to_vec_pretty(index).map_err(|e| CacheError::StoreCorrupt {
            path: self.file.clone(),
            message: format!("failed to serialize metadata: {}", e),
        })?;
        fs_utils::write_atomic(&self.file, &json)?;
        Ok(())
    }
}
