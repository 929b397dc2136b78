//! In-process stand-in for a git remote so installer tests never touch the
//! network.

#![allow(dead_code)]

use anyhow::anyhow;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use module_kernel::installer::{
    FetchContext, FetchError, InstallerSettings, RepoStatus, SourceFetcher,
};
use module_kernel::{ModuleInstaller, ModuleRegistry};

const ORIGIN_FILE: &str = ".fake-origin";
const HEAD_FILE: &str = ".fake-head";
const REMOTE_FILE: &str = ".fake-remote";
const DRIFT_FILE: &str = ".fake-drift";

#[derive(Clone, Debug)]
pub struct FakeRepo {
    pub revision: String,
    pub files: Vec<(String, String)>,
    /// Clone blocks until the context times out.
    pub hang: bool,
}

pub fn module_files(version: &str) -> Vec<(String, String)> {
    vec![
        ("requirements.txt".to_string(), "requests\n".to_string()),
        ("main.py".to_string(), format!("VERSION = '{version}'\n")),
        ("CHANGELOG".to_string(), format!("{version}: initial\n")),
    ]
}

#[derive(Clone, Default)]
pub struct FakeFetcher {
    repos: Arc<Mutex<HashMap<String, FakeRepo>>>,
    hold: Arc<AtomicBool>,
    held_urls: Arc<Mutex<HashSet<String>>>,
    entered: Arc<AtomicUsize>,
    clones: Arc<AtomicUsize>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, url: &str, revision: &str, files: Vec<(String, String)>) {
        self.repos.lock().unwrap().insert(
            url.to_string(),
            FakeRepo {
                revision: revision.to_string(),
                files,
                hang: false,
            },
        );
    }

    pub fn publish_hanging(&self, url: &str) {
        self.repos.lock().unwrap().insert(
            url.to_string(),
            FakeRepo {
                revision: "never".to_string(),
                files: module_files("never"),
                hang: true,
            },
        );
    }

    /// Block clones until [`FakeFetcher::release`].
    pub fn hold(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    /// Block clones of `url` only.
    pub fn hold_url(&self, url: &str) {
        self.held_urls.lock().unwrap().insert(url.to_string());
    }

    pub fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.held_urls.lock().unwrap().clear();
    }

    fn is_held(&self, url: &str) -> bool {
        self.hold.load(Ordering::SeqCst) || self.held_urls.lock().unwrap().contains(url)
    }

    /// Wait until `n` clones have started.
    pub fn wait_entered(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.entered.load(Ordering::SeqCst) < n {
            assert!(Instant::now() < deadline, "clone never started");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    pub fn clones(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }

    /// Make a local edit the fast-forward must refuse to clobber.
    pub fn simulate_drift(dir: &Path) {
        std::fs::write(dir.join("main.py"), "LOCAL = 'edit'\n").unwrap();
        std::fs::write(dir.join(DRIFT_FILE), "").unwrap();
    }

    fn repo(&self, url: &str) -> Option<FakeRepo> {
        self.repos.lock().unwrap().get(url).cloned()
    }
}

fn read_meta(dir: &Path, file: &str) -> Result<String, FetchError> {
    std::fs::read_to_string(dir.join(file))
        .map(|s| s.trim().to_string())
        .map_err(|e| FetchError::Failed(anyhow!("not a repository {}: {e}", dir.display())))
}

fn write_files(dir: &Path, files: &[(String, String)]) -> Result<(), FetchError> {
    for (name, body) in files {
        std::fs::write(dir.join(name), body).map_err(|e| FetchError::Failed(e.into()))?;
    }
    Ok(())
}

impl SourceFetcher for FakeFetcher {
    fn clone_shallow(
        &self,
        url: &str,
        _branch: &str,
        dest: &Path,
        ctx: &FetchContext,
    ) -> Result<String, FetchError> {
        let started = Instant::now();
        std::fs::create_dir_all(dest).map_err(|e| FetchError::Failed(e.into()))?;
        std::fs::write(dest.join("partial.pack"), "x").map_err(|e| FetchError::Failed(e.into()))?;
        self.entered.fetch_add(1, Ordering::SeqCst);

        let repo = self.repo(url);
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let hanging = repo.as_ref().is_some_and(|r| r.hang);
            if !hanging && !self.is_held(url) {
                break;
            }
            if started.elapsed() >= ctx.timeout {
                return Err(FetchError::Timeout {
                    what: "git clone".to_string(),
                    secs: ctx.timeout.as_secs(),
                });
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        let repo = repo.ok_or_else(|| FetchError::Failed(anyhow!("repository {url} not found")))?;
        std::fs::remove_file(dest.join("partial.pack")).map_err(|e| FetchError::Failed(e.into()))?;
        write_files(dest, &repo.files)?;
        std::fs::write(dest.join(ORIGIN_FILE), url).map_err(|e| FetchError::Failed(e.into()))?;
        std::fs::write(dest.join(HEAD_FILE), &repo.revision)
            .map_err(|e| FetchError::Failed(e.into()))?;
        self.clones.fetch_add(1, Ordering::SeqCst);
        Ok(repo.revision)
    }

    fn fetch(&self, dir: &Path, _branch: &str, ctx: &FetchContext) -> Result<String, FetchError> {
        if ctx.cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let url = read_meta(dir, ORIGIN_FILE)?;
        let repo = self
            .repo(&url)
            .ok_or_else(|| FetchError::Failed(anyhow!("repository {url} not found")))?;
        if repo.hang {
            return Err(FetchError::Timeout {
                what: "git fetch".to_string(),
                secs: ctx.timeout.as_secs(),
            });
        }
        std::fs::write(dir.join(REMOTE_FILE), &repo.revision)
            .map_err(|e| FetchError::Failed(e.into()))?;
        Ok(repo.revision)
    }

    fn fast_forward(&self, dir: &Path, _branch: &str) -> Result<String, FetchError> {
        if dir.join(DRIFT_FILE).exists() {
            return Err(FetchError::NotFastForward("1 locally modified file(s)".into()));
        }
        let url = read_meta(dir, ORIGIN_FILE)?;
        let remote = read_meta(dir, REMOTE_FILE)?;
        let repo = self
            .repo(&url)
            .ok_or_else(|| FetchError::Failed(anyhow!("repository {url} not found")))?;
        write_files(dir, &repo.files)?;
        std::fs::write(dir.join(HEAD_FILE), &remote).map_err(|e| FetchError::Failed(e.into()))?;
        Ok(remote)
    }

    fn head(&self, dir: &Path) -> Result<String, FetchError> {
        read_meta(dir, HEAD_FILE)
    }

    fn status(&self, dir: &Path, _branch: &str) -> Result<RepoStatus, FetchError> {
        let head = self.head(dir)?;
        Ok(RepoStatus {
            remote_head: read_meta(dir, REMOTE_FILE).unwrap_or_else(|_| head.clone()),
            head,
            modified_files: usize::from(dir.join(DRIFT_FILE).exists()),
            remote_url: read_meta(dir, ORIGIN_FILE)?,
        })
    }
}

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub fetcher: FakeFetcher,
    pub registry: Arc<ModuleRegistry>,
    pub installer: Arc<ModuleInstaller>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(5))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = FakeFetcher::new();
        let registry = Arc::new(
            ModuleRegistry::open(&module_kernel::shared_memory_uri()).expect("open registry"),
        );
        let mut settings = InstallerSettings::new(dir.path().join("extensions"));
        settings.fetch_timeout = timeout;
        let installer = Arc::new(ModuleInstaller::new(
            registry.clone(),
            Box::new(fetcher.clone()),
            settings,
        ));
        Self {
            dir,
            fetcher,
            registry,
            installer,
        }
    }

    pub fn module_root(&self) -> PathBuf {
        self.dir.path().join("extensions")
    }

    pub fn staging_dir(&self, name: &str) -> PathBuf {
        self.module_root().join(".partial").join(name)
    }
}
