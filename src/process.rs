//! External process execution
//!
//! Runs version-control commands and the code-mapping engine with:
//! - a scrubbed environment (only an allowlist is inherited)
//! - captured, normalized output (lossy UTF-8, no BOM, `\n` line endings)
//! - a hard timeout that kills the whole child process tree
//! - background mode returning a handle that can be awaited or killed
//!
//! Each child is started in its own process group (Unix) or process group
//! with `CREATE_NEW_PROCESS_GROUP` (Windows) so the tree can be torn down
//! without touching the orchestrator. Call sites never see these details.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::{CacheError, Result};

/// Variables every child may inherit
const BASE_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TMPDIR",
    "TEMP",
    "TMP",
    "SSH_AUTH_SOCK",
    "XDG_CONFIG_HOME",
    "XDG_CACHE_HOME",
    "USERPROFILE",
    "APPDATA",
    "LOCALAPPDATA",
    "PROGRAMDATA",
    "SYSTEMROOT",
    "SYSTEMDRIVE",
    "WINDIR",
    "COMSPEC",
    "PATHEXT",
];

/// Bytes of stdout/stderr retained per stream
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

/// A command to run: program, arguments, working directory, extra env
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Set a variable explicitly for this child (bypasses the allowlist)
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// `program arg1 arg2`, for logs and error messages
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Best human-readable explanation of a failure: stderr, else stdout
    pub fn error_text(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let text = tail_chars(text, 2000);
        match self.exit_code {
            Some(code) if text.is_empty() => format!("exited with status {}", code),
            Some(code) => format!("exited with status {}: {}", code, text),
            None if text.is_empty() => "terminated by signal".to_string(),
            None => format!("terminated by signal: {}", text),
        }
    }
}

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    let start = text.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &text[start..]
}

/// Decode captured bytes: lossy UTF-8, BOM stripped, CRLF folded to LF
pub fn normalize_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
    text.replace("\r\n", "\n")
}

/// Kills a process tree by id; cheap to clone and safe to call after exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillHandle {
    pid: u32,
}

impl KillHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn kill_tree(&self) {
        kill_tree(self.pid);
    }
}

/// Runs external commands with a sanitized environment
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    passthrough_env: Vec<String>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also let children inherit these variables
    pub fn with_passthrough_env(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.passthrough_env.extend(names);
        self
    }

    /// Run to completion, killing the process tree if `timeout` elapses
    pub async fn run(&self, command: &ProcessCommand, timeout: Duration) -> Result<ProcessOutput> {
        let process = self.run_background(command)?;
        process.wait_timeout(timeout).await
    }

    /// Start without waiting; the returned handle owns the child
    pub fn run_background(&self, command: &ProcessCommand) -> Result<BackgroundProcess> {
        let mut cmd = self.build(command)?;
        let mut child = cmd.spawn().map_err(|e| CacheError::Process {
            program: command.program.clone(),
            message: format!("failed to spawn: {}", e),
        })?;

        let pid = child.id();
        let stdout_task = child.stdout.take().map(spawn_drain);
        let stderr_task = child.stderr.take().map(spawn_drain);

        tracing::debug!(pid = ?pid, command = %command.display(), "Spawned process");

        Ok(BackgroundProcess {
            program: command.program.clone(),
            pid,
            child,
            stdout_task,
            stderr_task,
        })
    }

    fn build(&self, command: &ProcessCommand) -> Result<Command> {
        let program = resolve_program(&command.program)?;

        let mut cmd = Command::new(program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear();

        for name in BASE_ENV
            .iter()
            .copied()
            .chain(self.passthrough_env.iter().map(String::as_str))
        {
            if let Some(value) = std::env::var_os(name) {
                cmd.env(name, value);
            }
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
        }

        Ok(cmd)
    }
}

/// Resolve a bare program name through `PATH` (honoring `PATHEXT` on Windows)
fn resolve_program(program: &str) -> Result<PathBuf> {
    let as_path = Path::new(program);
    if as_path.components().count() > 1 || as_path.is_absolute() {
        return Ok(as_path.to_path_buf());
    }
    which::which(program).map_err(|e| CacheError::Process {
        program: program.to_string(),
        message: format!("not found on PATH: {}", e),
    })
}

/// A running child whose output is being captured
#[derive(Debug)]
pub struct BackgroundProcess {
    program: String,
    pid: Option<u32>,
    child: Child,
    stdout_task: Option<JoinHandle<Vec<u8>>>,
    stderr_task: Option<JoinHandle<Vec<u8>>>,
}

impl BackgroundProcess {
    /// OS process id (also the process-group id on Unix)
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn kill_handle(&self) -> Option<KillHandle> {
        self.pid.map(|pid| KillHandle { pid })
    }

    /// Poll without blocking: `Some(exit_code)` once the child has exited
    pub fn try_status(&mut self) -> Result<Option<Option<i32>>> {
        Ok(self.child.try_wait()?.map(|status| status.code()))
    }

    /// Kill the child and everything it started
    pub fn kill(&mut self) {
        if let Some(pid) = self.pid {
            kill_tree(pid);
        }
        let _ = self.child.start_kill();
    }

    /// Wait for exit and collect output
    pub async fn wait(mut self) -> Result<ProcessOutput> {
        let status = self.child.wait().await?;
        let stdout = collect(self.stdout_task.take()).await;
        let stderr = collect(self.stderr_task.take()).await;
        Ok(ProcessOutput {
            stdout: normalize_output(&stdout),
            stderr: normalize_output(&stderr),
            exit_code: status.code(),
        })
    }

    /// Wait at most `timeout`; on expiry kill the tree and report `Timeout`
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<ProcessOutput> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                let stdout = collect(self.stdout_task.take()).await;
                let stderr = collect(self.stderr_task.take()).await;
                Ok(ProcessOutput {
                    stdout: normalize_output(&stdout),
                    stderr: normalize_output(&stderr),
                    exit_code: status.code(),
                })
            }
            Err(_) => {
                tracing::warn!(
                    pid = ?self.pid,
                    program = %self.program,
                    timeout_secs = timeout.as_secs(),
                    "Process timed out, killing process tree"
                );
                self.kill();
                let _ = self.child.wait().await;
                Err(CacheError::Timeout {
                    program: self.program.clone(),
                    after: timeout,
                })
            }
        }
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        // Abandoned while still running: take the whole tree down, not just
        // the direct child that `kill_on_drop` covers.
        if let Ok(None) = self.child.try_wait() {
            self.kill();
        }
    }
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

/// Read a pipe to EOF, keeping only the last `MAX_CAPTURE_BYTES`.
///
/// The pipe is always drained so a chatty child never blocks on a full pipe.
fn spawn_drain<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut kept = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    kept.extend_from_slice(&chunk[..n]);
                    if kept.len() > MAX_CAPTURE_BYTES {
                        let excess = kept.len() - MAX_CAPTURE_BYTES;
                        kept.drain(..excess);
                    }
                }
            }
        }
        kept
    })
}

#[cfg(unix)]
fn kill_tree(pid: u32) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid signals the process group created
    // for this child by `process_group(0)`; it has no memory-safety effects.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(windows)]
fn kill_tree(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(any(unix, windows)))]
fn kill_tree(_pid: u32) {}
