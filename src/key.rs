//! Cache key derivation
//!
//! Maps `(source location, branch, strategy)` to a stable, filesystem-safe
//! directory name under the cache root. Everything here is pure: no
//! filesystem access, no clock, no environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CacheError, Result};

/// Character substituted for anything unsafe in a path component
const SUBSTITUTE: char = '-';

/// Maximum length of the human-readable parts of a key
const MAX_COMPONENT_LEN: usize = 48;

/// Hex digits of the content hash kept in the key
const HASH_LEN: usize = 16;

/// Directory under the cache root holding working copies
pub const REPOS_DIR: &str = "repos";

/// Directory under the cache root holding build artifacts
pub const BUILDS_DIR: &str = "builds";

/// Policy governing whether branches share one working copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// One working copy per source, re-checked-out per request
    #[default]
    Shared,
    /// One working copy per (source, branch)
    PerBranch,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::Shared => "shared",
            CacheStrategy::PerBranch => "per-branch",
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => Ok(CacheStrategy::Shared),
            "per-branch" | "per_branch" | "perbranch" => Ok(CacheStrategy::PerBranch),
            other => Err(format!(
                "unknown cache strategy '{}' (expected 'shared' or 'per-branch')",
                other
            )),
        }
    }
}

/// Where a source location points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// A URL or scp-style address handled by the version-control tool
    Remote,
    /// A directory on the local filesystem
    Local,
}

impl SourceKind {
    /// Classify a source location by its syntax alone
    pub fn classify(source: &str) -> Self {
        let s = source.trim();
        const SCHEMES: [&str; 6] = ["http://", "https://", "ssh://", "git://", "file://", "git+ssh://"];
        if SCHEMES.iter().any(|scheme| s.to_ascii_lowercase().starts_with(scheme)) {
            return SourceKind::Remote;
        }
        if is_scp_like(s) {
            return SourceKind::Remote;
        }
        SourceKind::Local
    }
}

/// `user@host:path`, as accepted by git for ssh remotes
fn is_scp_like(s: &str) -> bool {
    let Some(colon) = s.find(':') else {
        return false;
    };
    let head = &s[..colon];
    match head.find('@') {
        Some(at) => at > 0 && at + 1 < head.len() && !head.contains('/') && !head.contains('\\'),
        None => false,
    }
}

/// Check a source location for syntax problems and classify it.
///
/// Existence of local paths is not checked here.
pub fn validate_source(source: &str) -> Result<SourceKind> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(CacheError::invalid_source(source, "source location is empty"));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(CacheError::invalid_source(
            source,
            "source location contains control characters",
        ));
    }

    let kind = SourceKind::classify(trimmed);
    if kind == SourceKind::Remote {
        if let Some((scheme, rest)) = trimmed.split_once("://") {
            let host = rest.split('/').next().unwrap_or("");
            if host.is_empty() && !scheme.eq_ignore_ascii_case("file") {
                return Err(CacheError::invalid_source(source, "URL has no host"));
            }
            if rest[host.len()..].trim_matches('/').is_empty() {
                return Err(CacheError::invalid_source(source, "URL has no repository path"));
            }
        }
    }
    Ok(kind)
}

/// Canonical textual form of a source used for hashing.
///
/// Surrounding whitespace and trailing separators are dropped so that
/// `https://host/repo` and `https://host/repo/` share a key.
pub fn normalize_source(source: &str) -> String {
    let trimmed = source.trim();
    let stripped = trimmed.trim_end_matches(['/', '\\']);
    if stripped.is_empty() {
        trimmed.to_string()
    } else {
        stripped.to_string()
    }
}

/// Normalize an optional branch: blank names mean "default branch"
pub fn normalize_branch(branch: Option<&str>) -> Option<String> {
    branch
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
}

/// Reject branch names git would read as something other than a ref.
///
/// A leading `-` would be parsed as a command-line option.
pub fn validate_branch(source: &str, branch: &str) -> Result<()> {
    let reason = if branch.starts_with('-') {
        "branch name must not start with '-'"
    } else if branch.chars().any(|c| c.is_control() || c.is_whitespace()) {
        "branch name contains whitespace or control characters"
    } else {
        return Ok(());
    };
    Err(CacheError::invalid_source(
        source,
        format!("{} (got '{}')", reason, branch.escape_debug()),
    ))
}

/// Replace every character that is unsafe in a path component.
///
/// Separators, colons, whitespace and anything outside `[A-Za-z0-9._-]`
/// become `-`. Leading dots are replaced too so a component can never be
/// `.`, `..` or a hidden file.
pub fn sanitize_component(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                SUBSTITUTE
            }
        })
        .collect();

    let leading_dots = out.chars().take_while(|c| *c == '.').count();
    if leading_dots > 0 {
        out.replace_range(..leading_dots, &SUBSTITUTE.to_string().repeat(leading_dots));
    }
    out.truncate(MAX_COMPONENT_LEN);
    out
}

/// Human-readable repository name: last path segment without `.git`
fn repo_name(source: &str) -> String {
    let name = source
        .rsplit(['/', '\\', ':'])
        .find(|seg| !seg.is_empty())
        .unwrap_or("repo");
    let name = name.strip_suffix(".git").unwrap_or(name);
    let sanitized = sanitize_component(name);
    if sanitized.is_empty() {
        "repo".to_string()
    } else {
        sanitized
    }
}

/// Content hash over everything that distinguishes one entry from another
fn key_hash(source: &str, branch: Option<&str>, strategy: CacheStrategy) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(strategy.as_str().as_bytes());
    hasher.update([0u8]);
    if strategy == CacheStrategy::PerBranch {
        match branch {
            Some(b) => {
                hasher.update([1u8]);
                hasher.update(b.as_bytes());
            }
            None => hasher.update([0u8]),
        }
    }
    let digest = hex::encode(hasher.finalize());
    digest[..HASH_LEN].to_string()
}

/// Derive the cache key (a single directory name) for a request.
///
/// `shared` keys ignore the branch; `per-branch` keys include a sanitized
/// branch for readability, while the hash covers the raw branch so two
/// branches that sanitize identically still get distinct keys.
pub fn cache_key(source: &str, branch: Option<&str>, strategy: CacheStrategy) -> String {
    let source = normalize_source(source);
    let branch = normalize_branch(branch);
    let hash = key_hash(&source, branch.as_deref(), strategy);
    let name = repo_name(&source);

    match (strategy, branch.as_deref()) {
        (CacheStrategy::PerBranch, Some(b)) => {
            format!("{}-{}-{}", name, sanitize_component(b), hash)
        }
        (CacheStrategy::PerBranch, None) => format!("{}-default-{}", name, hash),
        (CacheStrategy::Shared, _) => format!("{}-{}", name, hash),
    }
}

/// Resolves request tuples to paths under one cache root
#[derive(Debug, Clone)]
pub struct KeyResolver {
    root: PathBuf,
}

impl KeyResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache root this resolver derives paths under
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all working copies
    pub fn repos_dir(&self) -> PathBuf {
        self.root.join(REPOS_DIR)
    }

    /// Directory holding all build artifacts
    pub fn builds_dir(&self) -> PathBuf {
        self.root.join(BUILDS_DIR)
    }

    /// Working-copy path for a request. Pure and deterministic.
    pub fn resolve(&self, source: &str, branch: Option<&str>, strategy: CacheStrategy) -> PathBuf {
        self.repos_dir().join(cache_key(source, branch, strategy))
    }

    /// Build artifact directory belonging to a working copy
    pub fn build_dir_for(&self, path: &Path) -> PathBuf {
        let key = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.builds_dir().join(key)
    }
}
