//! Clone-then-build lifecycle through the facade
//!
//! Covers the happy path, gated reads while work is in flight, duplicate
//! suppression, failure and retry, refresh, and shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use codemap_cache::metadata::SHUTDOWN_REASON;
use codemap_cache::{
    BuildState, CacheError, CloneState, FileContent, ReadOutcome, Readiness,
};

use crate::common::{
    assert_readiness, cache_config, open_facade, wait_for_readiness, FakeVcs, ScriptEngine,
    TestRepo,
};

const URL: &str = "https://example.com/org/app.git";

// ============================================================================
// HAPPY PATH
// ============================================================================

#[tokio::test]
async fn test_fresh_clone_builds_map() {
    let root = TempDir::new().unwrap();
    let vcs = Arc::new(FakeVcs::open());
    let facade = open_facade(
        cache_config(root.path()),
        vcs.clone(),
        Arc::new(ScriptEngine::listing()),
    );

    let accepted = facade.resolve(URL, None, None).await.unwrap();
    assert_eq!(accepted.entry.source_location, URL);
    assert!(accepted.entry.path.starts_with(root.path().join("repos")));

    let path = accepted.entry.path.clone();
    let ready = wait_for_readiness(&facade, &path, Readiness::Ready).await;
    assert_eq!(ready.entry.clone_status.state, CloneState::Cloned);
    assert_eq!(ready.entry.build_status.state, BuildState::Complete);
    assert!(ready.entry.build_status.build_id.is_some());

    let output = ready.entry.build_status.output_location.clone().unwrap();
    assert!(output.starts_with(root.path().join("builds")));

    match facade.read_map(&path).unwrap() {
        ReadOutcome::Ready { content } => {
            assert!(content.contains("src/lib.rs"), "map: {}", content);
            assert!(content.contains("README.md"), "map: {}", content);
            assert!(!content.contains(".git"), "map: {}", content);
        }
        other => panic!("expected a map, got {:?}", other),
    }
    assert_eq!(vcs.clone_count(), 1);

    tokio::time::timeout(Duration::from_secs(10), facade.wait_for_background())
        .await
        .unwrap();
    assert!(!facade.has_background_work());
}

#[tokio::test]
async fn test_second_resolve_reuses_entry() {
    let root = TempDir::new().unwrap();
    let vcs = Arc::new(FakeVcs::open());
    let facade = open_facade(
        cache_config(root.path()),
        vcs.clone(),
        Arc::new(ScriptEngine::listing()),
    );

    let first = facade.resolve(URL, None, None).await.unwrap();
    wait_for_readiness(&facade, &first.entry.path, Readiness::Ready).await;

    // Trailing slash and whitespace normalize to the same key.
    let second = facade
        .resolve(&format!("  {}/ ", URL), None, None)
        .await
        .unwrap();
    assert_eq!(second.entry.path, first.entry.path);
    assert_readiness(&second, Readiness::Ready);
    assert!(second.entry.last_access >= first.entry.last_access);
    assert_eq!(vcs.clone_count(), 1);
}

#[tokio::test]
async fn test_local_directory_is_copied_without_ignored_files() {
    let source = TestRepo::new();
    source.with_sample_layout();

    let root = TempDir::new().unwrap();
    let vcs = Arc::new(FakeVcs::open());
    let facade = open_facade(
        cache_config(root.path()),
        vcs.clone(),
        Arc::new(ScriptEngine::listing()),
    );

    let accepted = facade.resolve(&source.path_str(), None, None).await.unwrap();
    let path = accepted.entry.path.clone();
    wait_for_readiness(&facade, &path, Readiness::Ready).await;

    assert!(path.join("src/main.rs").is_file());
    assert!(!path.join("target").exists());
    assert!(!path.join("debug.log").exists());
    assert_eq!(vcs.clone_count(), 0, "local copies never go through git");

    let map = match facade.read_map(&path).unwrap() {
        ReadOutcome::Ready { content } => content,
        other => panic!("expected a map, got {:?}", other),
    };
    assert!(map.contains("web/index.ts"));
    assert!(!map.contains("target/"));
}

#[tokio::test]
async fn test_local_directory_rejects_branch() {
    let source = TestRepo::new();
    source.with_sample_layout();

    let root = TempDir::new().unwrap();
    let facade = open_facade(
        cache_config(root.path()),
        Arc::new(FakeVcs::open()),
        Arc::new(ScriptEngine::listing()),
    );

    let err = facade
        .resolve(&source.path_str(), Some("main"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidSource { .. }), "{:?}", err);
    assert!(facade.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_sources_are_rejected() {
    let root = TempDir::new().unwrap();
    let facade = open_facade(
        cache_config(root.path()),
        Arc::new(FakeVcs::open()),
        Arc::new(ScriptEngine::listing()),
    );

    for source in ["", "   ", "https://", "https://host.com/", "/definitely/not/here"] {
        let err = facade.resolve(source, None, None).await.unwrap_err();
        assert!(
            matches!(err, CacheError::InvalidSource { .. }),
            "{:?} gave {:?}",
            source,
            err
        );
    }
}

// ============================================================================
// GATED READS AND DUPLICATE SUPPRESSION
// ============================================================================

#[tokio::test]
async fn test_reads_report_not_ready_while_cloning() {
    let root = TempDir::new().unwrap();
    let vcs = Arc::new(FakeVcs::gated());
    let facade = open_facade(
        cache_config(root.path()),
        vcs.clone(),
        Arc::new(ScriptEngine::listing()),
    );

    let accepted = facade.resolve(URL, None, None).await.unwrap();
    let path = accepted.entry.path.clone();
    assert_readiness(&accepted, Readiness::Cloning);

    match facade.read_map(&path).unwrap() {
        ReadOutcome::NotReady { readiness, .. } => assert_eq!(readiness, Readiness::Cloning),
        other => panic!("expected not ready, got {:?}", other),
    }
    assert!(matches!(
        facade.read_file(&path, Path::new("src/lib.rs")).unwrap(),
        ReadOutcome::NotReady { .. }
    ));

    // The build starts by itself once the clone lands.
    let build = facade.ensure_built(&path).await.unwrap();
    assert_eq!(build.state, BuildState::NotStarted);

    vcs.release(1);
    wait_for_readiness(&facade, &path, Readiness::Ready).await;
}

#[tokio::test]
async fn test_concurrent_resolves_clone_once() {
    let root = TempDir::new().unwrap();
    let vcs = Arc::new(FakeVcs::gated());
    let facade = open_facade(
        cache_config(root.path()),
        vcs.clone(),
        Arc::new(ScriptEngine::listing()),
    );

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let facade = Arc::clone(&facade);
        tasks.push(tokio::spawn(async move {
            facade.resolve(URL, None, None).await.unwrap()
        }));
    }
    let mut paths = Vec::new();
    for task in tasks {
        let status = task.await.unwrap();
        assert_readiness(&status, Readiness::Cloning);
        paths.push(status.entry.path);
    }
    paths.dedup();
    assert_eq!(paths.len(), 1);
    assert_eq!(facade.list().unwrap().len(), 1);

    vcs.release(8);
    wait_for_readiness(&facade, &paths[0], Readiness::Ready).await;
    assert_eq!(vcs.clone_count(), 1);
}

#[tokio::test]
async fn test_ensure_built_is_idempotent() {
    let root = TempDir::new().unwrap();
    let facade = open_facade(
        cache_config(root.path()),
        Arc::new(FakeVcs::open()),
        Arc::new(ScriptEngine::listing()),
    );

    let path = facade.resolve(URL, None, None).await.unwrap().entry.path;
    let ready = wait_for_readiness(&facade, &path, Readiness::Ready).await;

    let again = facade.ensure_built(&path).await.unwrap();
    assert_eq!(again.state, BuildState::Complete);
    assert_eq!(again.build_id, ready.entry.build_status.build_id);

    // A missing artifact means the map has to be rebuilt.
    let output = ready.entry.build_status.output_location.unwrap();
    std::fs::remove_file(&output).unwrap();
    let rebuilt = facade.ensure_built(&path).await.unwrap();
    assert_ne!(rebuilt.build_id, ready.entry.build_status.build_id);
    wait_for_readiness(&facade, &path, Readiness::Ready).await;
}

#[tokio::test]
async fn test_running_build_is_never_duplicated() {
    let root = TempDir::new().unwrap();
    let facade = open_facade(
        cache_config(root.path()),
        Arc::new(FakeVcs::open()),
        Arc::new(ScriptEngine::hanging()),
    );

    let path = facade.resolve(URL, None, None).await.unwrap().entry.path;
    let building = wait_for_readiness(&facade, &path, Readiness::Building).await;
    let id = building.entry.build_status.build_id;
    assert!(id.is_some());

    let first = facade.ensure_built(&path).await.unwrap();
    let second = facade.ensure_built(&path).await.unwrap();
    assert_eq!(first.build_id, id);
    assert_eq!(second.build_id, id);

    // A busy entry cannot be removed.
    assert!(matches!(
        facade.remove(&path),
        Err(CacheError::AlreadyInProgress { .. })
    ));

    facade.shutdown().unwrap();
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn test_failed_clone_cleans_up_and_retries() {
    let root = TempDir::new().unwrap();
    let vcs = Arc::new(FakeVcs::open());
    vcs.set_failing(true);
    let facade = open_facade(
        cache_config(root.path()),
        vcs.clone(),
        Arc::new(ScriptEngine::listing()),
    );

    let path = facade.resolve(URL, None, None).await.unwrap().entry.path;
    let failed = wait_for_readiness(&facade, &path, Readiness::CloneFailed).await;
    let error = failed.entry.clone_status.error.clone().unwrap();
    assert!(error.contains("not found"), "error: {}", error);
    assert!(!path.exists(), "partial clone must be removed");

    match facade.read_map(&path).unwrap() {
        ReadOutcome::Failed { error } => assert!(error.contains("not found")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(matches!(
        facade.ensure_built(&path).await,
        Err(CacheError::NotReady { .. })
    ));

    vcs.set_failing(false);
    let retry = facade.resolve(URL, None, None).await.unwrap();
    assert_eq!(retry.entry.path, path);
    assert_readiness(&retry, Readiness::Cloning);
    wait_for_readiness(&facade, &path, Readiness::Ready).await;
    assert_eq!(vcs.clone_count(), 2);
}

#[tokio::test]
async fn test_engine_failure_is_recorded() {
    let root = TempDir::new().unwrap();
    let facade = open_facade(
        cache_config(root.path()),
        Arc::new(FakeVcs::open()),
        Arc::new(ScriptEngine::failing()),
    );

    let path = facade.resolve(URL, None, None).await.unwrap().entry.path;
    let failed = wait_for_readiness(&facade, &path, Readiness::BuildFailed).await;
    let error = failed.entry.build_status.error.unwrap();
    assert!(error.contains("engine exploded"), "error: {}", error);
    assert!(error.contains("status 3"), "error: {}", error);

    // The working copy stays usable.
    assert!(matches!(
        facade.read_file(&path, Path::new("README.md")).unwrap(),
        ReadOutcome::Ready { .. }
    ));
}

#[tokio::test]
async fn test_engine_without_output_falls_back_to_stdout() {
    let root = TempDir::new().unwrap();
    let facade = open_facade(
        cache_config(root.path()),
        Arc::new(FakeVcs::open()),
        Arc::new(ScriptEngine::new("echo 'map from stdout'")),
    );

    let path = facade.resolve(URL, None, None).await.unwrap().entry.path;
    wait_for_readiness(&facade, &path, Readiness::Ready).await;
    match facade.read_map(&path).unwrap() {
        ReadOutcome::Ready { content } => assert_eq!(content.trim(), "map from stdout"),
        other => panic!("expected a map, got {:?}", other),
    }
}

// ============================================================================
// REFRESH AND READS
// ============================================================================

#[tokio::test]
async fn test_refresh_pulls_and_rebuilds() {
    let root = TempDir::new().unwrap();
    let vcs = Arc::new(FakeVcs::open());
    let facade = open_facade(
        cache_config(root.path()),
        vcs.clone(),
        Arc::new(ScriptEngine::listing()),
    );

    let path = facade.resolve(URL, None, None).await.unwrap().entry.path;
    let before = wait_for_readiness(&facade, &path, Readiness::Ready).await;

    let outcome = facade.refresh(&path).await.unwrap();
    assert!(outcome.started());
    assert_eq!(vcs.pull_count(), 1);

    let after = wait_for_readiness(&facade, &path, Readiness::Ready).await;
    assert_ne!(
        after.entry.build_status.build_id,
        before.entry.build_status.build_id
    );
    match facade.read_map(&path).unwrap() {
        ReadOutcome::Ready { content } => assert!(content.contains("src/pulled.rs")),
        other => panic!("expected a map, got {:?}", other),
    }

    // Only the newest build's artifacts are kept.
    tokio::time::timeout(Duration::from_secs(10), facade.wait_for_background())
        .await
        .unwrap();
    let builds = root
        .path()
        .join("builds")
        .join(path.file_name().unwrap());
    let kept: Vec<_> = std::fs::read_dir(&builds).unwrap().collect();
    assert_eq!(kept.len(), 1);
}

#[tokio::test]
async fn test_failed_local_refresh_keeps_working_copy() {
    let source = TestRepo::new();
    source.with_sample_layout();

    let root = TempDir::new().unwrap();
    let facade = open_facade(
        cache_config(root.path()),
        Arc::new(FakeVcs::open()),
        Arc::new(ScriptEngine::listing()),
    );
    let path = facade
        .resolve(&source.path_str(), None, None)
        .await
        .unwrap()
        .entry
        .path;
    let before = wait_for_readiness(&facade, &path, Readiness::Ready).await;
    facade.wait_for_background().await;

    std::fs::remove_dir_all(source.path()).unwrap();
    let err = facade.refresh(&path).await.unwrap_err();
    assert!(matches!(err, CacheError::CloneFailed { .. }), "{:?}", err);

    // The previous copy and its map are still served.
    let after = facade.status(&path).unwrap();
    assert_readiness(&after, Readiness::Ready);
    assert!(after.entry.update.is_none());
    assert_eq!(
        after.entry.build_status.build_id,
        before.entry.build_status.build_id
    );
    match facade.read_file(&path, Path::new("src/main.rs")).unwrap() {
        ReadOutcome::Ready {
            content: FileContent::File { text },
        } => assert!(!text.is_empty()),
        other => panic!("expected the old file, got {:?}", other),
    }

    let repos: Vec<String> = std::fs::read_dir(root.path().join("repos"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(repos.len(), 1, "no staging leftovers: {:?}", repos);
}

#[tokio::test]
async fn test_local_refresh_replaces_working_copy() {
    let source = TestRepo::new();
    source.with_sample_layout();

    let root = TempDir::new().unwrap();
    let facade = open_facade(
        cache_config(root.path()),
        Arc::new(FakeVcs::open()),
        Arc::new(ScriptEngine::listing()),
    );
    let path = facade
        .resolve(&source.path_str(), None, None)
        .await
        .unwrap()
        .entry
        .path;
    wait_for_readiness(&facade, &path, Readiness::Ready).await;
    facade.wait_for_background().await;

    source.add_file("src/late.rs", "pub fn late() {}\n");
    std::fs::remove_file(source.path().join("src/app.rs")).unwrap();

    assert!(facade.refresh(&path).await.unwrap().started());
    assert!(path.join("src/late.rs").is_file());
    assert!(!path.join("src/app.rs").exists());

    wait_for_readiness(&facade, &path, Readiness::Ready).await;
    match facade.read_map(&path).unwrap() {
        ReadOutcome::Ready { content } => assert!(content.contains("src/late.rs")),
        other => panic!("expected a map, got {:?}", other),
    }
}

#[tokio::test]
async fn test_read_file_stays_inside_working_copy() {
    let root = TempDir::new().unwrap();
    let facade = open_facade(
        cache_config(root.path()),
        Arc::new(FakeVcs::open()),
        Arc::new(ScriptEngine::listing()),
    );

    let path = facade.resolve(URL, None, None).await.unwrap().entry.path;
    wait_for_readiness(&facade, &path, Readiness::Ready).await;

    match facade.read_file(&path, Path::new("src/lib.rs")).unwrap() {
        ReadOutcome::Ready {
            content: FileContent::File { text },
        } => assert_eq!(text, "pub fn lib() {}\n"),
        other => panic!("expected file content, got {:?}", other),
    }
    match facade.read_file(&path, Path::new(".")).unwrap() {
        ReadOutcome::Ready {
            content: FileContent::Directory { entries },
        } => {
            assert!(entries.contains(&"src/".to_string()));
            assert!(entries.contains(&"README.md".to_string()));
            assert!(!entries.iter().any(|e| e.starts_with(".git")));
        }
        other => panic!("expected a listing, got {:?}", other),
    }

    assert!(matches!(
        facade.read_file(&path, Path::new("../../metadata.json")),
        Err(CacheError::InvalidSource { .. })
    ));
    assert!(matches!(
        facade.read_file(&path, Path::new("/etc/passwd")),
        Err(CacheError::InvalidSource { .. })
    ));
    assert!(facade.read_file(&path, Path::new("missing.rs")).is_err());
}

// ============================================================================
// SHUTDOWN
// ============================================================================

#[tokio::test]
async fn test_shutdown_fails_in_flight_build() {
    let root = TempDir::new().unwrap();
    let facade = open_facade(
        cache_config(root.path()),
        Arc::new(FakeVcs::open()),
        Arc::new(ScriptEngine::hanging()),
    );

    let path = facade.resolve(URL, None, None).await.unwrap().entry.path;
    wait_for_readiness(&facade, &path, Readiness::Building).await;
    assert!(facade.has_background_work());

    let report = facade.shutdown().unwrap();
    assert_eq!(report.builds, 1);
    assert_eq!(report.clones, 0);
    assert!(!facade.has_background_work());

    let status = facade.status(&path).unwrap();
    assert_readiness(&status, Readiness::BuildFailed);
    assert_eq!(
        status.entry.build_status.error.as_deref(),
        Some(SHUTDOWN_REASON)
    );
}

#[tokio::test]
async fn test_shutdown_fails_in_flight_clone() {
    let root = TempDir::new().unwrap();
    let vcs = Arc::new(FakeVcs::gated());
    let facade = open_facade(
        cache_config(root.path()),
        vcs.clone(),
        Arc::new(ScriptEngine::listing()),
    );

    let path = facade.resolve(URL, None, None).await.unwrap().entry.path;
    let report = facade.shutdown().unwrap();
    assert_eq!(report.clones, 1);

    let status = facade.status(&path).unwrap();
    assert_readiness(&status, Readiness::CloneFailed);
    assert!(!path.exists());

    // Releasing the gate afterwards must not resurrect the aborted clone.
    vcs.release(1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_readiness(&facade.status(&path).unwrap(), Readiness::CloneFailed);
}
