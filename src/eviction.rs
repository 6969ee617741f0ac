//! Capacity enforcement
//!
//! Keeps the number of cache entries at or below a configured maximum by
//! retiring the least recently used entries that are neither cloning nor
//! building. Each removal deletes the working copy, the build artifacts and
//! the metadata record inside one store mutation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{CacheError, Result};
use crate::fs_utils;
use crate::key::KeyResolver;
use crate::metadata::{CacheEntry, MetadataStore};

/// What one enforcement pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Entries removed, oldest first
    pub evicted: Vec<PathBuf>,
    /// Candidates whose directories could not be deleted; their records stay
    pub failed: Vec<PathBuf>,
    /// Entry count after the pass
    pub remaining: usize,
    pub max_entries: usize,
}

impl EvictionReport {
    /// Still over the limit because every remaining entry is busy
    pub fn over_capacity(&self) -> bool {
        self.remaining > self.max_entries
    }

    /// The transient over-capacity condition, if it holds
    pub fn capacity_error(&self) -> Option<CacheError> {
        self.over_capacity().then(|| CacheError::CapacityExceeded {
            entries: self.remaining,
            max_entries: self.max_entries,
        })
    }
}

/// Retires least-recently-used entries
#[derive(Debug, Clone)]
pub struct EvictionManager {
    store: Arc<MetadataStore>,
    resolver: KeyResolver,
}

impl EvictionManager {
    pub fn new(store: Arc<MetadataStore>, resolver: KeyResolver) -> Self {
        Self { store, resolver }
    }

    /// Evict oldest non-busy entries until at most `max_entries` remain.
    ///
    /// If every remaining entry is busy the limit is left exceeded; the
    /// report says so and a later pass corrects it once work finishes.
    pub fn enforce_limit(&self, max_entries: usize) -> Result<EvictionReport> {
        let resolver = &self.resolver;
        let report = self.store.update(|index| {
            let mut report = EvictionReport {
                max_entries,
                ..Default::default()
            };

            if index.len() > max_entries {
                let mut candidates: Vec<&CacheEntry> =
                    index.entries().filter(|e| e.is_evictable()).collect();
                candidates.sort_by(|a, b| {
                    a.last_access
                        .cmp(&b.last_access)
                        .then_with(|| a.path.cmp(&b.path))
                });
                let candidates: Vec<PathBuf> =
                    candidates.into_iter().map(|e| e.path.clone()).collect();

                for path in candidates {
                    if index.len() <= max_entries {
                        break;
                    }
                    if remove_entry_dirs(resolver, &path) {
                        index.remove(&path);
                        report.evicted.push(path);
                    } else {
                        report.failed.push(path);
                    }
                }
            }

            report.remaining = index.len();
            Ok(report)
        })?;

        for path in &report.evicted {
            tracing::info!(path = %path.display(), "Evicted cache entry");
        }
        if let Some(e) = report.capacity_error() {
            tracing::warn!("{}", e);
        }
        Ok(report)
    }

    /// Remove one entry on request. Busy entries are refused.
    pub fn remove(&self, path: &Path) -> Result<CacheEntry> {
        let removed = self.store.update(|index| {
            let entry = index.get(path).ok_or_else(|| CacheError::NotFound {
                path: path.to_path_buf(),
            })?;
            if entry.is_busy() {
                return Err(CacheError::AlreadyInProgress {
                    path: path.to_path_buf(),
                });
            }
            fs_utils::remove_tree(path)?;
            fs_utils::remove_tree(&self.resolver.build_dir_for(path))?;
            index.remove(path).ok_or_else(|| CacheError::NotFound {
                path: path.to_path_buf(),
            })
        })?;
        tracing::info!(path = %path.display(), "Removed cache entry");
        Ok(removed)
    }
}

/// Best-effort removal of an entry's working copy and build artifacts.
///
/// Returns false if either directory could not be deleted.
pub(crate) fn remove_entry_dirs(resolver: &KeyResolver, path: &Path) -> bool {
    let mut removed = true;
    for dir in [path.to_path_buf(), resolver.build_dir_for(path)] {
        if let Err(e) = fs_utils::remove_tree(&dir) {
            tracing::warn!(dir = %dir.display(), "Could not remove directory: {}", e);
            removed = false;
        }
    }
    removed
}
