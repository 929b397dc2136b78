//! Remote source fetching.
//!
//! Network operations can block indefinitely, so every call carries a
//! [`FetchContext`] with a hard timeout and a cancellation flag. The child is
//! polled rather than waited on; on expiry or cancellation it is killed and
//! reaped before returning.

use anyhow::{anyhow, Context};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Shared cancellation flag for an in-flight operation.
///
/// A token may also watch a marker file, which lets another process cancel
/// the operation by creating it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    marker: Option<Arc<PathBuf>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancelled by [`CancelToken::cancel`] or once `marker` exists.
    pub fn watching(marker: impl Into<PathBuf>) -> Self {
        Self {
            flag: Arc::default(),
            marker: Some(Arc::new(marker.into())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.marker.as_ref().is_some_and(|m| m.exists())
    }
}

#[derive(Clone, Debug)]
pub struct FetchContext {
    pub timeout: Duration,
    pub cancel: CancelToken,
}

impl FetchContext {
    pub fn new(timeout: Duration, cancel: CancelToken) -> Self {
        Self { timeout, cancel }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{what} timed out after {secs}s")]
    Timeout { what: String, secs: u64 },

    #[error("cancelled")]
    Cancelled,

    /// Local history or working tree diverged from the remote branch.
    #[error("not a fast-forward: {0}")]
    NotFastForward(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Repository state as reported by `module info` and `kernel info`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RepoStatus {
    pub head: String,
    pub remote_head: String,
    pub modified_files: usize,
    pub remote_url: String,
}

/// Fetches and advances module working trees.
pub trait SourceFetcher: Send + Sync {
    /// Shallow clone of `branch` only into `dest`. Returns the checked-out revision.
    fn clone_shallow(
        &self,
        url: &str,
        branch: &str,
        dest: &Path,
        ctx: &FetchContext,
    ) -> Result<String, FetchError>;

    /// Fetch the latest remote revision of `branch` without touching the working tree.
    fn fetch(&self, dir: &Path, branch: &str, ctx: &FetchContext) -> Result<String, FetchError>;

    /// Advance the working tree to the fetched revision, fast-forward only.
    fn fast_forward(&self, dir: &Path, branch: &str) -> Result<String, FetchError>;

    fn head(&self, dir: &Path) -> Result<String, FetchError>;

    fn status(&self, dir: &Path, branch: &str) -> Result<RepoStatus, FetchError>;
}

/// [`SourceFetcher`] backed by the `git` binary.
#[derive(Clone, Debug)]
pub struct GitCli {
    program: String,
    local_timeout: Duration,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
            local_timeout: Duration::from_secs(30),
        }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    fn git(&self, dir: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_ASKPASS", "true")
            .stdin(Stdio::null());
        cmd
    }

    /// Run a repository-local command (no network) with the local timeout.
    fn local(&self, dir: &Path, args: &[&str]) -> Result<String, FetchError> {
        let mut cmd = self.git(Some(dir));
        cmd.args(args);
        let ctx = FetchContext::new(self.local_timeout, CancelToken::new());
        let output = run_with_deadline(cmd, &format!("git {}", args.join(" ")), &ctx)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn remote_ref(branch: &str) -> String {
        format!("refs/remotes/origin/{branch}")
    }
}

impl SourceFetcher for GitCli {
    fn clone_shallow(
        &self,
        url: &str,
        branch: &str,
        dest: &Path,
        ctx: &FetchContext,
    ) -> Result<String, FetchError> {
        let mut cmd = self.git(None);
        cmd.args([
            "clone",
            "--depth",
            "1",
            "--single-branch",
            "--no-tags",
            "--branch",
            branch,
            "--",
            url,
        ])
        .arg(dest);
        run_with_deadline(cmd, "git clone", ctx)?;
        self.head(dest)
    }

    fn fetch(&self, dir: &Path, branch: &str, ctx: &FetchContext) -> Result<String, FetchError> {
        let refspec = format!("+refs/heads/{branch}:{}", Self::remote_ref(branch));
        let mut cmd = self.git(Some(dir));
        cmd.args(["fetch", "--no-tags", "origin", &refspec]);
        run_with_deadline(cmd, "git fetch", ctx)?;
        self.local(dir, &["rev-parse", &Self::remote_ref(branch)])
    }

    fn fast_forward(&self, dir: &Path, branch: &str) -> Result<String, FetchError> {
        let dirty = self.local(dir, &["status", "--porcelain", "--untracked-files=no"])?;
        if !dirty.is_empty() {
            return Err(FetchError::NotFastForward(format!(
                "{} locally modified file(s)",
                dirty.lines().count()
            )));
        }
        let remote = Self::remote_ref(branch);
        let mut cmd = self.git(Some(dir));
        cmd.args(["merge-base", "--is-ancestor", "HEAD", &remote]);
        let ctx = FetchContext::new(self.local_timeout, CancelToken::new());
        match run_with_deadline(cmd, "git merge-base", &ctx) {
            Ok(_) => {}
            Err(FetchError::Failed(_)) => {
                return Err(FetchError::NotFastForward(format!(
                    "local history has diverged from {remote}"
                )))
            }
            Err(other) => return Err(other),
        }
        // git refuses before touching the tree, e.g. when an untracked local
        // file would be overwritten by an incoming one.
        match self.local(dir, &["merge", "--ff-only", &remote]) {
            Ok(_) => {}
            Err(FetchError::Failed(err)) => {
                return Err(FetchError::NotFastForward(format!(
                    "merge refused: {err:#}"
                )))
            }
            Err(other) => return Err(other),
        }
        self.head(dir)
    }

    fn head(&self, dir: &Path) -> Result<String, FetchError> {
        self.local(dir, &["rev-parse", "HEAD"])
    }

    fn status(&self, dir: &Path, branch: &str) -> Result<RepoStatus, FetchError> {
        let remote = Self::remote_ref(branch);
        let changed = self.local(dir, &["diff", "--name-only", &remote])?;
        Ok(RepoStatus {
            head: self.head(dir)?,
            remote_head: self.local(dir, &["rev-parse", &remote])?,
            modified_files: changed.lines().filter(|l| !l.trim().is_empty()).count(),
            remote_url: self.local(dir, &["remote", "get-url", "origin"])?,
        })
    }
}

/// Spawn `cmd` and wait for it within `ctx`'s bounds.
pub fn run_with_deadline(
    mut cmd: Command,
    what: &str,
    ctx: &FetchContext,
) -> Result<Output, FetchError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let child = cmd
        .spawn()
        .with_context(|| format!("failed to start {what}"))?;
    wait_with_deadline(child, what, ctx)
}

/// Wait for an already spawned child within `ctx`'s bounds.
///
/// Pipes are drained on helper threads so a chatty child cannot block on a
/// full pipe while the deadline is being polled.
pub fn wait_with_deadline(
    mut child: Child,
    what: &str,
    ctx: &FetchContext,
) -> Result<Output, FetchError> {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let started = Instant::now();

    let status = loop {
        if let Some(status) = child.try_wait().context("failed to poll child")? {
            break status;
        }
        if ctx.cancel.is_cancelled() {
            reap(&mut child);
            return Err(FetchError::Cancelled);
        }
        if started.elapsed() >= ctx.timeout {
            reap(&mut child);
            log::warn!("{what} exceeded {}s, killed", ctx.timeout.as_secs());
            return Err(FetchError::Timeout {
                what: what.to_string(),
                secs: ctx.timeout.as_secs(),
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let output = Output {
        status,
        stdout: join(stdout),
        stderr: join(stderr),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FetchError::Failed(anyhow!(
            "{what} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(output)
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
