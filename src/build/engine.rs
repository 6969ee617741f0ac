//! Boundary with the external code-mapping engine
//!
//! The engine is a black box: it receives a working-copy root, a file
//! listing the sources to map, an output location and a token budget, and
//! either writes a result artifact or exits nonzero.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{CacheError, Result};
use crate::process::ProcessCommand;

/// Inputs for one engine invocation
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub build_id: Uuid,
    /// Working-copy root
    pub root: PathBuf,
    /// Newline-separated list of files relative to `root`
    pub files_list: PathBuf,
    /// Where the engine must write its artifact
    pub output: PathBuf,
}

/// Produces the command that builds a code map
pub trait MapEngine: Send + Sync {
    fn command(&self, request: &BuildRequest) -> ProcessCommand;
}

/// Engine invoked as a configurable external command.
///
/// Arguments may contain the placeholders `{root}`, `{files}`, `{output}`,
/// `{max_tokens}` and `{build_id}`.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    max_tokens: u32,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>, max_tokens: u32) -> Self {
        Self {
            program: program.into(),
            args,
            max_tokens,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone(), config.max_tokens)
    }

    fn expand(&self, template: &str, request: &BuildRequest) -> String {
        template
            .replace("{root}", &request.root.to_string_lossy())
            .replace("{files}", &request.files_list.to_string_lossy())
            .replace("{output}", &request.output.to_string_lossy())
            .replace("{max_tokens}", &self.max_tokens.to_string())
            .replace("{build_id}", &request.build_id.to_string())
    }
}

impl MapEngine for CommandEngine {
    fn command(&self, request: &BuildRequest) -> ProcessCommand {
        let args: Vec<String> = self.args.iter().map(|a| self.expand(a, request)).collect();
        ProcessCommand::new(self.program.clone())
            .args(args)
            .current_dir(&request.root)
    }
}

/// Chooses which files of a working copy are handed to the engine
pub trait FileSelector: Send + Sync {
    /// Paths relative to `root`, in a stable order
    fn select(&self, root: &Path) -> Result<Vec<PathBuf>>;
}

/// Selects every regular file not excluded by `.gitignore`, `.ignore` or
/// hidden-file rules, skipping files larger than a size cap.
#[derive(Debug, Clone)]
pub struct GitignoreSelector {
    max_file_bytes: u64,
}

impl Default for GitignoreSelector {
    fn default() -> Self {
        Self {
            max_file_bytes: 1024 * 1024,
        }
    }
}

impl GitignoreSelector {
    pub fn with_max_file_bytes(max_file_bytes: u64) -> Self {
        Self { max_file_bytes }
    }
}

impl FileSelector for GitignoreSelector {
    fn select(&self, root: &Path) -> Result<Vec<PathBuf>> {
        if !root.is_dir() {
            return Err(CacheError::NotFound {
                path: root.to_path_buf(),
            });
        }

        let walker = ignore::WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(true)
            .git_exclude(true)
            .require_git(false)
            .build();

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Skipping unreadable path: {}", e);
                    continue;
                }
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let too_big = entry
                .metadata()
                .map(|m| m.len() > self.max_file_bytes)
                .unwrap_or(true);
            if too_big {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(root) {
                files.push(relative.to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }
}
