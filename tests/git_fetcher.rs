//! The installer against the real `git` binary and a bare repository served
//! over `file://`. Skipped when git is not on PATH.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use module_kernel::installer::{
    FetchContext, FetchError, InstallerSettings, RepoStatus, SourceFetcher,
};
use module_kernel::{
    shared_memory_uri, CancelToken, GitCli, KernelError, ModuleInstaller, ModuleRegistry,
    ModuleStatus,
};

const MOD_URL: &str = "https://example.com/mod.git";

fn have_git() -> bool {
    if which::which("git").is_ok() {
        return true;
    }
    eprintln!("git not found, skipping");
    false
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "kernel tests")
        .env("GIT_AUTHOR_EMAIL", "tests@example.com")
        .env("GIT_COMMITTER_NAME", "kernel tests")
        .env("GIT_COMMITTER_EMAIL", "tests@example.com")
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A bare repository plus the checkout that pushes to it.
struct Upstream {
    work: PathBuf,
}

impl Upstream {
    fn create(remotes: &Path, name: &str) -> Self {
        let bare = remotes.join(format!("{name}.git"));
        let work = remotes.join(format!("{name}-work"));
        std::fs::create_dir_all(&bare).unwrap();
        std::fs::create_dir_all(&work).unwrap();
        git(&bare, &["init", "-q", "--bare"]);
        git(&bare, &["symbolic-ref", "HEAD", "refs/heads/master"]);
        git(&work, &["init", "-q"]);
        git(&work, &["symbolic-ref", "HEAD", "refs/heads/master"]);
        git(&work, &["remote", "add", "origin", bare.to_str().unwrap()]);

        let upstream = Self { work };
        upstream.commit(
            &[
                ("requirements.txt", "requests\n"),
                ("main.py", "VERSION = '1'\n"),
                ("CHANGELOG", "1: initial\n"),
            ],
            "initial",
        );
        upstream
    }

    fn commit(&self, files: &[(&str, &str)], message: &str) -> String {
        for (name, body) in files {
            std::fs::write(self.work.join(name), body).unwrap();
        }
        git(&self.work, &["add", "-A"]);
        git(&self.work, &["commit", "-q", "-m", message]);
        git(&self.work, &["push", "-q", "origin", "master"]);
        self.head()
    }

    fn head(&self) -> String {
        git(&self.work, &["rev-parse", "HEAD"])
    }
}

/// Serves `https://example.com/<name>.git` from `<remotes>/<name>.git`.
struct Mirror {
    inner: GitCli,
    remotes: PathBuf,
}

impl SourceFetcher for Mirror {
    fn clone_shallow(
        &self,
        url: &str,
        branch: &str,
        dest: &Path,
        ctx: &FetchContext,
    ) -> Result<String, FetchError> {
        let file = url.rsplit('/').next().unwrap_or_default();
        let local = format!("file://{}", self.remotes.join(file).display());
        self.inner.clone_shallow(&local, branch, dest, ctx)
    }

    fn fetch(&self, dir: &Path, branch: &str, ctx: &FetchContext) -> Result<String, FetchError> {
        self.inner.fetch(dir, branch, ctx)
    }

    fn fast_forward(&self, dir: &Path, branch: &str) -> Result<String, FetchError> {
        self.inner.fast_forward(dir, branch)
    }

    fn head(&self, dir: &Path) -> Result<String, FetchError> {
        self.inner.head(dir)
    }

    fn status(&self, dir: &Path, branch: &str) -> Result<RepoStatus, FetchError> {
        self.inner.status(dir, branch)
    }
}

struct GitFixture {
    dir: tempfile::TempDir,
    registry: Arc<ModuleRegistry>,
    installer: ModuleInstaller,
}

impl GitFixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let remotes = dir.path().join("remotes");
        std::fs::create_dir_all(&remotes).unwrap();
        let registry = Arc::new(ModuleRegistry::open(&shared_memory_uri()).unwrap());
        let fetcher = Mirror {
            inner: GitCli::new(),
            remotes,
        };
        let installer = ModuleInstaller::new(
            registry.clone(),
            Box::new(fetcher),
            InstallerSettings::new(dir.path().join("extensions")),
        );
        Self {
            dir,
            registry,
            installer,
        }
    }

    fn upstream(&self, name: &str) -> Upstream {
        Upstream::create(&self.dir.path().join("remotes"), name)
    }

    fn module_dir(&self, name: &str) -> PathBuf {
        self.dir.path().join("extensions").join(name)
    }
}

#[test]
fn install_checks_out_upstream_head() {
    if !have_git() {
        return;
    }
    let fx = GitFixture::new();
    let upstream = fx.upstream("mod");

    let record = fx.installer.install(MOD_URL, &CancelToken::new()).unwrap();
    assert_eq!(record.revision, upstream.head());
    assert_eq!(record.status, ModuleStatus::Installed);
    assert_eq!(record.install_path, fx.module_dir("mod"));
    assert!(fx.module_dir("mod").join("main.py").is_file());
    assert!(!fx.dir.path().join("extensions/.partial/mod").exists());
    assert_eq!(git(&fx.module_dir("mod"), &["rev-parse", "HEAD"]), upstream.head());
}

#[test]
fn clean_update_fast_forwards_to_remote() {
    if !have_git() {
        return;
    }
    let fx = GitFixture::new();
    let upstream = fx.upstream("mod");
    let installed = fx.installer.install(MOD_URL, &CancelToken::new()).unwrap();

    let next = upstream.commit(&[("main.py", "VERSION = '2'\n")], "two");
    let updated = fx.installer.update("mod", &CancelToken::new()).unwrap();
    assert_ne!(updated.revision, installed.revision);
    assert_eq!(updated.revision, next);
    assert_eq!(updated.status, ModuleStatus::Installed);
    assert_eq!(
        std::fs::read_to_string(fx.module_dir("mod").join("main.py")).unwrap(),
        "VERSION = '2'\n"
    );

    let repo = fx.installer.info("mod").unwrap().repo.unwrap();
    assert_eq!(repo.head, next);
    assert_eq!(repo.remote_head, next);
    assert_eq!(repo.modified_files, 0);

    std::fs::write(fx.module_dir("mod").join("main.py"), "LOCAL = 1\n").unwrap();
    let repo = fx.installer.info("mod").unwrap().repo.unwrap();
    assert_eq!(repo.modified_files, 1);
}

#[test]
fn committed_drift_is_an_update_conflict() {
    if !have_git() {
        return;
    }
    let fx = GitFixture::new();
    let upstream = fx.upstream("mod");
    let installed = fx.installer.install(MOD_URL, &CancelToken::new()).unwrap();

    let dir = fx.module_dir("mod");
    std::fs::write(dir.join("local.txt"), "mine\n").unwrap();
    git(&dir, &["add", "local.txt"]);
    git(&dir, &["commit", "-q", "-m", "local"]);
    let local_head = git(&dir, &["rev-parse", "HEAD"]);
    upstream.commit(&[("main.py", "VERSION = '2'\n")], "two");

    let err = fx.installer.update("mod", &CancelToken::new()).unwrap_err();
    assert!(matches!(err, KernelError::UpdateConflict { .. }), "{err}");
    assert_eq!(fx.registry.get("mod").unwrap().unwrap(), installed);
    assert_eq!(git(&dir, &["rev-parse", "HEAD"]), local_head);
    assert_eq!(
        std::fs::read_to_string(dir.join("main.py")).unwrap(),
        "VERSION = '1'\n"
    );
}

#[test]
fn untracked_file_in_the_way_is_an_update_conflict() {
    if !have_git() {
        return;
    }
    let fx = GitFixture::new();
    let upstream = fx.upstream("mod");
    let installed = fx.installer.install(MOD_URL, &CancelToken::new()).unwrap();

    let dir = fx.module_dir("mod");
    std::fs::write(dir.join("new.py"), "LOCAL = 1\n").unwrap();
    upstream.commit(&[("new.py", "UPSTREAM = 1\n")], "add new.py");

    let err = fx.installer.update("mod", &CancelToken::new()).unwrap_err();
    assert!(matches!(err, KernelError::UpdateConflict { .. }), "{err}");
    assert_eq!(err.kind(), "update_conflict");

    let record = fx.registry.get("mod").unwrap().unwrap();
    assert_eq!(record, installed);
    assert_eq!(record.status, ModuleStatus::Installed);
    assert_eq!(git(&dir, &["rev-parse", "HEAD"]), installed.revision);
    assert_eq!(
        std::fs::read_to_string(dir.join("new.py")).unwrap(),
        "LOCAL = 1\n"
    );
}

#[test]
fn missing_remote_leaves_nothing_behind() {
    if !have_git() {
        return;
    }
    let fx = GitFixture::new();

    let err = fx
        .installer
        .install("https://example.com/absent.git", &CancelToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), "install_error", "{err}");
    assert!(fx.registry.get("absent").unwrap().is_none());
    assert!(!fx.module_dir("absent").exists());
    assert!(!fx.dir.path().join("extensions/.partial/absent").exists());
}
