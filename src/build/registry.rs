//! In-memory record of the builds this process launched
//!
//! Persisted metadata stays the source of truth for build state. The
//! registry only remembers what this process can still act on: the task
//! driving each build and the engine's process tree, so stale sweeps and
//! shutdown can stop them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::process::KillHandle;

#[derive(Debug)]
struct OwnedBuild {
    build_id: Uuid,
    process: Option<KillHandle>,
    task: Option<AbortHandle>,
}

impl OwnedBuild {
    fn stop(self) {
        if let Some(process) = self.process {
            process.kill_tree();
        }
        if let Some(task) = self.task {
            task.abort();
        }
    }
}

/// Builds owned by this process, keyed by working-copy path
#[derive(Debug, Default)]
pub struct BuildRegistry {
    builds: Mutex<HashMap<PathBuf, OwnedBuild>>,
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim ownership of a build attempt
    pub fn register(&self, path: &Path, build_id: Uuid) {
        self.builds.lock().insert(
            path.to_path_buf(),
            OwnedBuild {
                build_id,
                process: None,
                task: None,
            },
        );
    }

    /// Attach the task driving the attempt; ignored if the attempt is gone
    pub fn attach_task(&self, path: &Path, build_id: Uuid, task: AbortHandle) {
        let mut builds = self.builds.lock();
        match builds.get_mut(path) {
            Some(owned) if owned.build_id == build_id => owned.task = Some(task),
            _ => {}
        }
    }

    /// Attach the engine process of the attempt; ignored if the attempt is gone
    pub fn attach_process(&self, path: &Path, build_id: Uuid, process: KillHandle) {
        let mut builds = self.builds.lock();
        match builds.get_mut(path) {
            Some(owned) if owned.build_id == build_id => owned.process = Some(process),
            _ => {}
        }
    }

    /// Drop the record once the attempt has finished on its own
    pub fn release(&self, path: &Path, build_id: Uuid) -> bool {
        let mut builds = self.builds.lock();
        match builds.get(path) {
            Some(owned) if owned.build_id == build_id => {
                builds.remove(path);
                true
            }
            _ => false,
        }
    }

    /// Build id owned for `path`, if any
    pub fn owned(&self, path: &Path) -> Option<Uuid> {
        self.builds.lock().get(path).map(|b| b.build_id)
    }

    pub fn len(&self) -> usize {
        self.builds.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.builds.lock().is_empty()
    }

    /// Stop one attempt (process tree and task) and forget it
    pub fn stop(&self, path: &Path, build_id: Uuid) -> bool {
        let owned = {
            let mut builds = self.builds.lock();
            match builds.get(path) {
                Some(owned) if owned.build_id == build_id => builds.remove(path),
                _ => None,
            }
        };
        match owned {
            Some(owned) => {
                owned.stop();
                true
            }
            None => false,
        }
    }

    /// Stop everything and return what was owned
    pub fn drain(&self) -> Vec<(PathBuf, Uuid)> {
        let drained: Vec<(PathBuf, OwnedBuild)> = self.builds.lock().drain().collect();
        drained
            .into_iter()
            .map(|(path, owned)| {
                let build_id = owned.build_id;
                owned.stop();
                (path, build_id)
            })
            .collect()
    }
}
