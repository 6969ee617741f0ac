//! Stand-ins for git and the mapping engine

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use codemap_cache::process::ProcessCommand;
use codemap_cache::{BuildRequest, CacheError, MapEngine, Result, VersionControl};

/// Version control that "clones" by writing a few files.
///
/// Clones block on a gate until [`FakeVcs::release`] is called when the
/// fake is created closed, which lets tests observe the `cloning` state.
/// Checkouts can be held the same way with [`FakeVcs::with_gated_checkouts`].
pub struct FakeVcs {
    clones: AtomicUsize,
    gate: Semaphore,
    fail: AtomicBool,
    checkouts: Mutex<Vec<(PathBuf, String)>>,
    checkout_gate: Semaphore,
    checkouts_entered: AtomicUsize,
    pulls: AtomicUsize,
}

impl FakeVcs {
    /// Clones complete immediately
    pub fn open() -> Self {
        Self::with_permits(Semaphore::MAX_PERMITS)
    }

    /// Clones wait for [`FakeVcs::release`]
    pub fn gated() -> Self {
        Self::with_permits(0)
    }

    fn with_permits(permits: usize) -> Self {
        Self {
            clones: AtomicUsize::new(0),
            gate: Semaphore::new(permits),
            fail: AtomicBool::new(false),
            checkouts: Mutex::new(Vec::new()),
            checkout_gate: Semaphore::new(Semaphore::MAX_PERMITS),
            checkouts_entered: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
        }
    }

    /// Checkouts wait for [`FakeVcs::release_checkouts`]
    pub fn with_gated_checkouts(mut self) -> Self {
        self.checkout_gate = Semaphore::new(0);
        self
    }

    /// Let `n` waiting checkouts proceed
    pub fn release_checkouts(&self, n: usize) {
        self.checkout_gate.add_permits(n);
    }

    /// Checkouts that have started, finished or not
    pub fn checkouts_entered(&self) -> usize {
        self.checkouts_entered.load(Ordering::SeqCst)
    }

    /// Let `n` waiting clones proceed
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Make subsequent clones fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn clone_count(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// References checked out so far, in order
    pub fn checkouts(&self) -> Vec<String> {
        self.checkouts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn clone_repo(&self, source: &str, dest: &Path, branch: Option<&str>) -> Result<()> {
        self.clones.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(dest)?;
        std::fs::create_dir_all(dest.join(".git"))?;

        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| CacheError::CloneFailed {
                message: e.to_string(),
            })?;
        if self.fail.load(Ordering::SeqCst) {
            return Err(CacheError::CloneFailed {
                message: format!("fatal: repository '{}' not found", source),
            });
        }

        std::fs::create_dir_all(dest.join("src"))?;
        std::fs::write(dest.join("src/lib.rs"), "pub fn lib() {}\n")?;
        std::fs::write(dest.join("README.md"), format!("cloned from {}\n", source))?;
        std::fs::write(dest.join("BRANCH"), branch.unwrap_or("main"))?;
        Ok(())
    }

    async fn checkout(&self, repo: &Path, reference: &str) -> Result<()> {
        self.checkouts_entered.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .checkout_gate
            .acquire()
            .await
            .map_err(|e| CacheError::CloneFailed {
                message: e.to_string(),
            })?;
        std::fs::write(repo.join("BRANCH"), reference)?;
        self.checkouts
            .lock()
            .unwrap()
            .push((repo.to_path_buf(), reference.to_string()));
        Ok(())
    }

    async fn default_branch(&self, _repo: &Path) -> Result<String> {
        Ok("main".to_string())
    }

    async fn pull(&self, repo: &Path) -> Result<String> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        std::fs::write(repo.join("src/pulled.rs"), "pub fn pulled() {}\n")?;
        Ok("f".repeat(40))
    }

    async fn list_branches(&self, _repo: &Path) -> Result<Vec<String>> {
        Ok(vec!["develop".to_string(), "main".to_string()])
    }
}

/// Engine that runs a shell script.
///
/// The script sees `$OUT` (artifact path) and `$FILES` (file list) and runs
/// inside the working copy.
pub struct ScriptEngine {
    script: String,
}

impl ScriptEngine {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }

    /// Writes the selected file list as the map
    pub fn listing() -> Self {
        Self::new("cat \"$FILES\" > \"$OUT\"")
    }

    /// Never finishes on its own
    pub fn hanging() -> Self {
        Self::new("sleep 600")
    }

    pub fn failing() -> Self {
        Self::new("echo 'engine exploded' >&2; exit 3")
    }
}

impl MapEngine for ScriptEngine {
    fn command(&self, request: &BuildRequest) -> ProcessCommand {
        ProcessCommand::new("sh")
            .args(["-c", self.script.as_str()])
            .env("OUT", request.output.to_string_lossy())
            .env("FILES", request.files_list.to_string_lossy())
            .current_dir(&request.root)
    }
}
