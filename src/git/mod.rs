//! Version-control operations for working copies
//!
//! The orchestrators talk to git only through the [`VersionControl`] trait.
//! [`GitCli`] implements it by running the `git` executable through
//! [`ProcessRunner`], so every invocation gets the scrubbed environment,
//! output capture and timeout handling of that module.

mod branch;

pub use branch::{parse_default_branch, parse_remote_branches};

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CacheError, Result};
use crate::process::{ProcessCommand, ProcessRunner};

/// Operations the cache needs from a version-control tool
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Clone `source` into `dest`, optionally at `branch`
    async fn clone_repo(&self, source: &str, dest: &Path, branch: Option<&str>) -> Result<()>;

    /// Switch an existing working copy to `reference` in place
    async fn checkout(&self, repo: &Path, reference: &str) -> Result<()>;

    /// Name of the remote's default branch
    async fn default_branch(&self, repo: &Path) -> Result<String>;

    /// Fast-forward to the latest upstream commit; returns the new HEAD
    async fn pull(&self, repo: &Path) -> Result<String>;

    /// Branch names available on the remote
    async fn list_branches(&self, repo: &Path) -> Result<Vec<String>>;
}

/// [`VersionControl`] backed by the `git` command line
#[derive(Debug, Clone)]
pub struct GitCli {
    runner: ProcessRunner,
    clone_timeout: Duration,
    command_timeout: Duration,
}

impl GitCli {
    pub fn new(runner: ProcessRunner, clone_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            runner,
            clone_timeout,
            command_timeout,
        }
    }

    /// Run a git command and return trimmed stdout
    async fn git(&self, args: &[&str], cwd: Option<&Path>, timeout: Duration) -> Result<String> {
        let mut cmd = ProcessCommand::new("git")
            .args(args.iter().copied())
            // Never block on an interactive credential prompt.
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = cwd {
            cmd = cmd.current_dir(dir);
        }

        let output = self.runner.run(&cmd, timeout).await?;
        if !output.success() {
            return Err(CacheError::Process {
                program: "git".to_string(),
                message: format!("git {} failed: {}", args.join(" "), output.error_text()),
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Run a git command, returning None if it fails (for optional queries)
    async fn git_optional(&self, args: &[&str], cwd: &Path) -> Option<String> {
        self.git(args, Some(cwd), self.command_timeout).await.ok()
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn clone_repo(&self, source: &str, dest: &Path, branch: Option<&str>) -> Result<()> {
        let dest_str = dest.to_string_lossy().to_string();
        let mut args = vec!["clone", "--quiet"];
        if let Some(b) = branch {
            args.push("--branch");
            args.push(b);
        }
        args.push("--");
        args.push(source);
        args.push(&dest_str);

        self.git(&args, None, self.clone_timeout)
            .await
            .map(|_| ())
            .map_err(|e| CacheError::CloneFailed {
                message: e.to_string(),
            })
    }

    async fn checkout(&self, repo: &Path, reference: &str) -> Result<()> {
        let first = self
            .git(&["checkout", "--quiet", reference], Some(repo), self.command_timeout)
            .await;
        if first.is_ok() {
            return Ok(());
        }

        // The ref may postdate the clone: fetch and retry once.
        tracing::debug!(repo = %repo.display(), reference, "Checkout failed, fetching from origin");
        self.git(&["fetch", "--quiet", "origin"], Some(repo), self.command_timeout)
            .await
            .map_err(|e| CacheError::CloneFailed {
                message: e.to_string(),
            })?;
        self.git(&["checkout", "--quiet", reference], Some(repo), self.command_timeout)
            .await
            .map(|_| ())
            .map_err(|e| CacheError::CloneFailed {
                message: e.to_string(),
            })
    }

    async fn default_branch(&self, repo: &Path) -> Result<String> {
        if let Some(head) = self
            .git_optional(&["symbolic-ref", "refs/remotes/origin/HEAD"], repo)
            .await
        {
            if let Some(name) = parse_default_branch(&head) {
                return Ok(name);
            }
        }

        for candidate in ["main", "master"] {
            let remote_ref = format!("refs/remotes/origin/{}", candidate);
            if self
                .git_optional(&["show-ref", "--verify", "--quiet", &remote_ref], repo)
                .await
                .is_some()
            {
                return Ok(candidate.to_string());
            }
        }

        Err(CacheError::Process {
            program: "git".to_string(),
            message: format!("could not detect default branch of {}", repo.display()),
        })
    }

    async fn pull(&self, repo: &Path) -> Result<String> {
        self.git(&["pull", "--ff-only", "--quiet"], Some(repo), self.clone_timeout)
            .await?;
        self.git(&["rev-parse", "HEAD"], Some(repo), self.command_timeout)
            .await
    }

    async fn list_branches(&self, repo: &Path) -> Result<Vec<String>> {
        let out = self
            .git(
                &["branch", "--remotes", "--format=%(refname:short)"],
                Some(repo),
                self.command_timeout,
            )
            .await?;
        Ok(parse_remote_branches(&out))
    }
}
