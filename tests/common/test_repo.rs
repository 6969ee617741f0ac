//! TestRepo builder for integration testing
//!
//! Creates throwaway source repositories, optionally under git with
//! branches, and runs the codemap-cache binary against a private cache root.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Builder for creating test repository structures
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    /// Create a new empty test repository
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Get the path to the test repository root
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Get path as string
    pub fn path_str(&self) -> String {
        self.dir.path().to_string_lossy().to_string()
    }

    /// `file://` URL of this repository
    pub fn url(&self) -> String {
        format!("file://{}", self.path_str())
    }

    /// Add a source file with the given content
    pub fn add_file(&self, relative_path: &str, content: &str) -> &Self {
        let full_path = self.dir.path().join(relative_path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        fs::write(&full_path, content).expect("Failed to write file");
        self
    }

    /// Whether a `git` executable is available to the tests
    pub fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(&self, args: &[&str]) -> Output {
        let output = Command::new("git")
            .current_dir(self.path())
            .args(args)
            .output()
            .expect("Failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        output
    }

    /// Initialize as a git repository whose default branch is `main`
    pub fn init_git(&self) -> &Self {
        self.git(&["init", "--quiet"]);
        self.git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        self.git(&["config", "user.email", "test@test.com"]);
        self.git(&["config", "user.name", "Test User"]);
        self.git(&["config", "commit.gpgsign", "false"]);
        self
    }

    /// Create a git commit with all files
    pub fn commit(&self, message: &str) -> &Self {
        self.git(&["add", "-A"]);
        self.git(&["commit", "--quiet", "-m", message]);
        self
    }

    /// Create `name` from the current HEAD and switch to it
    pub fn create_branch(&self, name: &str) -> &Self {
        self.git(&["checkout", "--quiet", "-b", name]);
        self
    }

    /// Switch to an existing branch
    pub fn checkout(&self, name: &str) -> &Self {
        self.git(&["checkout", "--quiet", name]);
        self
    }

    /// Current HEAD commit id
    pub fn head(&self) -> String {
        String::from_utf8_lossy(&self.git(&["rev-parse", "HEAD"]).stdout)
            .trim()
            .to_string()
    }

    // ========================================================================
    // PRE-BUILT REPO STRUCTURES
    // ========================================================================

    /// A small multi-language project with an ignored build directory
    pub fn with_sample_layout(&self) -> &Self {
        self.add_file("README.md", "# sample\n")
            .add_file(".gitignore", "target/\n*.log\n")
            .add_file("src/main.rs", "fn main() {\n    app::run();\n}\n")
            .add_file("src/app.rs", "pub fn run() {}\n")
            .add_file("web/index.ts", "export function hello() { return 1; }\n")
            .add_file("target/debug/app", "binary")
            .add_file("debug.log", "noise")
    }

    /// A git repository on `main` with a `feature` branch adding one file
    pub fn with_git_branches(&self) -> &Self {
        self.init_git().with_sample_layout().commit("initial");
        self.create_branch("feature")
            .add_file("src/feature.rs", "pub fn feature() {}\n")
            .commit("add feature")
            .checkout("main")
    }

    // ========================================================================
    // CLI
    // ========================================================================

    /// Run the codemap-cache binary with `cache_root` as its cache.
    ///
    /// The configuration is read from `config.toml` inside the cache root if
    /// a test wrote one; otherwise defaults apply.
    pub fn run_cli(&self, cache_root: &Path, args: &[&str]) -> std::io::Result<Output> {
        let binary = PathBuf::from(env!("CARGO_BIN_EXE_codemap-cache"));
        Command::new(&binary)
            .current_dir(self.path())
            .env("CODEMAP_CACHE_ROOT", cache_root)
            .env("CODEMAP_CACHE_CONFIG", cache_root.join("config.toml"))
            .env_remove("RUST_LOG")
            .args(args)
            .output()
    }

    /// Run CLI and expect success, return stdout
    pub fn run_cli_success(&self, cache_root: &Path, args: &[&str]) -> String {
        let output = self.run_cli(cache_root, args).expect("Failed to run CLI");
        assert!(
            output.status.success(),
            "CLI command {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).to_string()
    }

    /// Run CLI and expect failure, return (exit code, stderr)
    pub fn run_cli_failure(&self, cache_root: &Path, args: &[&str]) -> (Option<i32>, String) {
        let output = self.run_cli(cache_root, args).expect("Failed to run CLI");
        assert!(
            !output.status.success(),
            "CLI command {:?} should have failed",
            args
        );
        (
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        )
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}
