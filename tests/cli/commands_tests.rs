//! Tests for the codemap-cache CLI commands
//!
//! Every test gets its own cache root and a config whose engine is a shell
//! one-liner that writes the selected file list as the map.

use std::fs;
use std::path::Path;

use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use codemap_cache::{BuildState, CacheEntry, CacheStrategy, MetadataStore};

use crate::common::TestRepo;

const ENGINE_CONFIG: &str = r#"
max_entries = 10

[engine]
program = "sh"
args = ["-c", "cat {files} > {output}"]
"#;

fn cache_root() -> TempDir {
    let root = TempDir::new().expect("Failed to create cache root");
    fs::write(root.path().join("config.toml"), ENGINE_CONFIG).expect("Failed to write config");
    root
}

fn parse_json(output: &str) -> serde_json::Value {
    serde_json::from_str(output)
        .unwrap_or_else(|e| panic!("invalid JSON ({}): {}", e, output))
}

/// Clone the repo and wait for its map; returns the entry path
fn clone_ready(repo: &TestRepo, root: &Path) -> String {
    let output = repo.run_cli_success(root, &["clone", &repo.path_str(), "--wait", "-f", "json"]);
    let json = parse_json(&output);
    assert_eq!(json["_type"], "clone");
    assert_eq!(json["readiness"], "ready", "{}", output);
    json["path"].as_str().expect("path field").to_string()
}

// ============================================================================
// BASICS
// ============================================================================

#[test]
fn test_help_lists_subcommands() {
    let repo = TestRepo::new();
    let root = cache_root();
    let output = repo.run_cli_success(root.path(), &["--help"]);
    for command in ["clone", "status", "build", "refresh", "map", "list", "evict", "reset"] {
        assert!(output.contains(command), "missing {} in help: {}", command, output);
    }
}

#[test]
fn test_list_empty_cache_json() {
    let repo = TestRepo::new();
    let root = cache_root();
    let output = repo.run_cli_success(root.path(), &["list", "-f", "json"]);
    let json = parse_json(&output);
    assert_eq!(json["_type"], "cache_list");
    assert_eq!(json["entries"], 0);
    assert_eq!(json["max_entries"], 10);
}

#[test]
fn test_list_empty_cache_text() {
    let repo = TestRepo::new();
    let root = cache_root();
    let output = repo.run_cli_success(root.path(), &["list"]);
    assert!(output.contains("entries: 0/10"), "{}", output);
    assert!(output.contains("No cached repositories."), "{}", output);
}

// ============================================================================
// ENTRY LIFECYCLE
// ============================================================================

#[test]
fn test_clone_wait_then_read_map_and_files() {
    let repo = TestRepo::new();
    repo.with_sample_layout();
    let root = cache_root();

    let path = clone_ready(&repo, root.path());
    assert!(Path::new(&path).starts_with(root.path().join("repos")));

    let map = repo.run_cli_success(root.path(), &["map", &path]);
    assert!(map.contains("src/main.rs"), "{}", map);
    assert!(!map.contains("debug.log"), "{}", map);

    let file = repo.run_cli_success(root.path(), &["read", &path, "src/app.rs"]);
    assert_eq!(file, "pub fn run() {}\n");

    let listing = repo.run_cli_success(root.path(), &["read", &path]);
    assert!(listing.lines().any(|l| l == "src/"), "{}", listing);

    let status = repo.run_cli_success(root.path(), &["status", &path, "-v"]);
    assert!(status.contains("readiness: ready"), "{}", status);
    assert!(status.contains("build_id: "), "{}", status);
}

#[test]
fn test_entry_addressable_by_key() {
    let repo = TestRepo::new();
    repo.with_sample_layout();
    let root = cache_root();

    let path = clone_ready(&repo, root.path());
    let key = Path::new(&path)
        .file_name()
        .unwrap()
        .to_string_lossy()
        .to_string();

    let output = repo.run_cli_success(root.path(), &["status", &key, "-f", "json"]);
    assert_eq!(parse_json(&output)["path"], path.as_str());
}

#[test]
fn test_clone_without_wait_finishes_before_exit() {
    let repo = TestRepo::new();
    repo.with_sample_layout();
    let root = cache_root();

    let output = repo.run_cli_success(root.path(), &["clone", &repo.path_str(), "-f", "json"]);
    let accepted = parse_json(&output);
    assert_eq!(accepted["readiness"], "cloning");
    let path = accepted["path"].as_str().unwrap().to_string();

    // The process stays up until its background work is done.
    let output = repo.run_cli_success(root.path(), &["status", &path, "-f", "json"]);
    assert_eq!(parse_json(&output)["readiness"], "ready", "{}", output);
}

#[test]
fn test_build_and_refresh_reuse_entry() {
    let repo = TestRepo::new();
    repo.with_sample_layout();
    let root = cache_root();
    let path = clone_ready(&repo, root.path());

    let before = parse_json(&repo.run_cli_success(root.path(), &["status", &path, "-f", "json"]));

    // Build of a ready entry is a no-op.
    let built = parse_json(&repo.run_cli_success(root.path(), &["build", &path, "--wait", "-f", "json"]));
    assert_eq!(built["buildStatus"]["buildId"], before["buildStatus"]["buildId"]);

    repo.add_file("src/extra.rs", "pub fn extra() {}\n");
    let refreshed = parse_json(&repo.run_cli_success(
        root.path(),
        &["refresh", &path, "--wait", "-f", "json"],
    ));
    assert_eq!(refreshed["_type"], "refresh");
    assert_eq!(refreshed["rebuildStarted"], true);
    assert_eq!(refreshed["readiness"], "ready");
    assert_ne!(refreshed["buildStatus"]["buildId"], before["buildStatus"]["buildId"]);

    let map = repo.run_cli_success(root.path(), &["map", &path]);
    assert!(map.contains("src/extra.rs"), "{}", map);
}

#[test]
fn test_remove_then_status_fails() {
    let repo = TestRepo::new();
    repo.with_sample_layout();
    let root = cache_root();
    let path = clone_ready(&repo, root.path());

    let output = repo.run_cli_success(root.path(), &["remove", &path]);
    assert!(output.starts_with("Removed "), "{}", output);
    assert!(!Path::new(&path).exists());

    let (code, stderr) = repo.run_cli_failure(root.path(), &["status", &path]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("No cache entry"), "{}", stderr);
}

#[test]
fn test_lingering_process_sweeps_stale_work() {
    let repo = TestRepo::new();
    repo.with_sample_layout();
    let root = TempDir::new().unwrap();
    fs::write(
        root.path().join("config.toml"),
        "sweep_interval_secs = 1\n\n[engine]\nprogram = \"sh\"\nargs = [\"-c\", \"sleep 3; cat {files} > {output}\"]\n",
    )
    .unwrap();

    // A build left behind by a process that died long ago.
    let orphan = root.path().join("repos").join("orphan");
    fs::create_dir_all(&orphan).unwrap();
    let store = MetadataStore::open(root.path()).unwrap();
    let at = Utc::now() - chrono::Duration::hours(2);
    store
        .update(|index| {
            let mut entry = CacheEntry::new(
                orphan.clone(),
                "https://example.com/org/orphan.git".to_string(),
                None,
                CacheStrategy::Shared,
                at,
            );
            entry.mark_cloning(at);
            entry.mark_cloned(at);
            assert!(entry.begin_build(at, Uuid::new_v4(), orphan.join("repo_map.txt")));
            index.insert(entry);
            Ok(())
        })
        .unwrap();

    // Nothing in `clone` sweeps by itself; only the background sweeper
    // running while the process waits for its build can.
    repo.run_cli_success(root.path(), &["clone", &repo.path_str()]);

    let index = store.read().unwrap();
    let entry = index.get(&orphan).expect("orphan record");
    assert_eq!(entry.build_status.state, BuildState::Failed);
    assert!(entry
        .build_status
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("presumed dead"));
}

// ============================================================================
// ERROR PATHS
// ============================================================================

#[test]
fn test_invalid_source_exit_code() {
    let repo = TestRepo::new();
    let root = cache_root();
    let (code, stderr) = repo.run_cli_failure(root.path(), &["clone", "https://"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains("Invalid source"), "{}", stderr);
}

#[test]
fn test_failed_build_exit_code_with_wait() {
    let repo = TestRepo::new();
    repo.with_sample_layout();
    let root = cache_root();
    fs::write(
        root.path().join("config.toml"),
        "[engine]\nprogram = \"sh\"\nargs = [\"-c\", \"echo broken >&2; exit 1\"]\n",
    )
    .unwrap();

    let (code, stderr) =
        repo.run_cli_failure(root.path(), &["clone", &repo.path_str(), "--wait"]);
    assert_eq!(code, Some(4));
    assert!(stderr.contains("broken"), "{}", stderr);
}

#[test]
fn test_reset_requires_force() {
    let repo = TestRepo::new();
    let root = cache_root();
    let (code, stderr) = repo.run_cli_failure(root.path(), &["reset"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains("--force"), "{}", stderr);
}

#[test]
fn test_corrupt_store_exit_code_and_reset() {
    let repo = TestRepo::new();
    let root = cache_root();
    fs::write(root.path().join("metadata.json"), "not json at all").unwrap();

    let (code, stderr) = repo.run_cli_failure(root.path(), &["list"]);
    assert_eq!(code, Some(5));
    assert!(stderr.contains("corrupt"), "{}", stderr);

    let output = repo.run_cli_success(root.path(), &["reset", "--force", "-f", "json"]);
    let json = parse_json(&output);
    assert_eq!(json["_type"], "cache_reset");
    assert!(json["quarantined_metadata"].is_string());

    repo.run_cli_success(root.path(), &["list"]);
}

#[test]
fn test_invalid_config_is_rejected() {
    let repo = TestRepo::new();
    let root = cache_root();
    fs::write(root.path().join("config.toml"), "max_entries = 0\n").unwrap();

    let (code, stderr) = repo.run_cli_failure(root.path(), &["list"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains("Configuration error"), "{}", stderr);
}
