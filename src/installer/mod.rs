//! Module installer.
//!
//! Installs are staged: the clone lands in `<module_root>/.partial/<name>`,
//! is validated, has its dependencies installed under the sandbox and is only
//! then renamed into place. The registry write that follows is the commit
//! point. A crash at any step leaves either the pre-install or the fully
//! installed state once [`ModuleInstaller::recover`] has run.
//!
//! Operations are serialized per module name. A second request for a name
//! that is busy fails fast with `AlreadyInProgress`; different names never
//! wait on each other.

pub mod fetch;
pub mod source;

use anyhow::{anyhow, Context};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use fetch::{CancelToken, FetchContext, FetchError, GitCli, RepoStatus, SourceFetcher};
pub use source::{validate_module_name, ModuleSource};

use crate::registry::{ModuleRecord, ModuleRegistry, ModuleStatus};
use crate::sandbox::{allowed_interpreter, Sandbox, SandboxCommand, SandboxPolicy};
use crate::{now_s, KernelError, Result};

const STAGING_DIR: &str = ".partial";
const CHANGELOG_MISSING: &str = "CHANGELOG not provided!";

#[derive(Clone, Debug)]
pub struct InstallerSettings {
    pub module_root: PathBuf,
    pub branch: String,
    pub manifest: String,
    pub entry_point: String,
    pub changelog: String,
    pub fetch_timeout: Duration,
}

impl InstallerSettings {
    pub fn new(module_root: impl Into<PathBuf>) -> Self {
        Self {
            module_root: module_root.into(),
            branch: "master".to_string(),
            manifest: "requirements.txt".to_string(),
            entry_point: "main.py".to_string(),
            changelog: "CHANGELOG".to_string(),
            fetch_timeout: Duration::from_secs(120),
        }
    }
}

/// Installs a module's dependency manifest inside the sandbox.
pub struct DependencyStep {
    pub sandbox: Sandbox,
    pub policy: SandboxPolicy,
    /// argv; `{manifest}` is replaced with the manifest path.
    pub command: Vec<String>,
}

impl DependencyStep {
    fn run(&self, module_dir: &Path, manifest: &Path, ctx: &FetchContext) -> anyhow::Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("dependency install command is empty"))?;
        let program = allowed_interpreter(&self.policy, program)
            .ok_or_else(|| anyhow!("{program} is not an allow-listed interpreter"))?;
        let manifest = manifest.to_string_lossy();
        let args = args.iter().map(|a| a.replace("{manifest}", &manifest));
        let cmd = SandboxCommand::new(program, module_dir).args(args);
        let child = self.sandbox.apply(&self.policy, &cmd)?;
        fetch::wait_with_deadline(child, "dependency install", ctx)
            .map_err(|e| anyhow!("{e}"))?;
        Ok(())
    }
}

#[derive(Default)]
struct NameLocks {
    held: Mutex<HashSet<String>>,
}

impl NameLocks {
    fn try_acquire(&self, name: &str) -> Result<NameGuard<'_>> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| KernelError::Storage(anyhow!("installer lock poisoned")))?;
        if !held.insert(name.to_string()) {
            return Err(KernelError::AlreadyInProgress(name.to_string()));
        }
        Ok(NameGuard {
            locks: self,
            name: name.to_string(),
        })
    }
}

struct NameGuard<'a> {
    locks: &'a NameLocks,
    name: String,
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut held) = self.locks.held.lock() {
            held.remove(&self.name);
        }
    }
}

/// A directory removed on drop unless committed.
struct StagedDir {
    path: PathBuf,
    committed: bool,
}

impl StagedDir {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for StagedDir {
    fn drop(&mut self) {
        if !self.committed {
            remove_tree(&self.path);
        }
    }
}

fn remove_tree(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::error!("failed to remove {}: {}", path.display(), e),
    }
}

/// `module info` payload.
#[derive(Clone, Debug, Serialize)]
pub struct ModuleInfo {
    pub record: ModuleRecord,
    pub repo: Option<RepoStatus>,
    pub changelog: String,
}

/// What [`ModuleInstaller::recover`] had to repair.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub staging_cleared: bool,
    pub removals_completed: Vec<String>,
    pub updates_resolved: Vec<String>,
    pub missing_dropped: Vec<String>,
    pub orphans_removed: Vec<String>,
}

pub struct ModuleInstaller {
    registry: Arc<ModuleRegistry>,
    fetcher: Box<dyn SourceFetcher>,
    settings: InstallerSettings,
    dependencies: Option<DependencyStep>,
    locks: NameLocks,
}

impl ModuleInstaller {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        fetcher: Box<dyn SourceFetcher>,
        settings: InstallerSettings,
    ) -> Self {
        Self {
            registry,
            fetcher,
            settings,
            dependencies: None,
            locks: NameLocks::default(),
        }
    }

    pub fn with_dependency_step(mut self, step: DependencyStep) -> Self {
        self.dependencies = Some(step);
        self
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &InstallerSettings {
        &self.settings
    }

    pub fn fetcher(&self) -> &dyn SourceFetcher {
        self.fetcher.as_ref()
    }

    fn fetch_context(&self, cancel: &CancelToken) -> FetchContext {
        FetchContext::new(self.settings.fetch_timeout, cancel.clone())
    }

    fn map_fetch(&self, name: &str, err: FetchError) -> KernelError {
        match err {
            FetchError::Timeout { what, secs } => KernelError::FetchTimeout {
                what: format!("{what} for module '{name}'"),
                secs,
            },
            FetchError::Cancelled => KernelError::Cancelled(name.to_string()),
            FetchError::NotFastForward(reason) => KernelError::UpdateConflict {
                name: name.to_string(),
                reason,
            },
            FetchError::Failed(source) => KernelError::install(name, source),
        }
    }

    fn validate_tree(&self, dir: &Path) -> anyhow::Result<()> {
        for required in [&self.settings.manifest, &self.settings.entry_point] {
            if !dir.join(required).is_file() {
                return Err(anyhow!("module is missing required file {required}"));
            }
        }
        Ok(())
    }

    fn install_dependencies(&self, dir: &Path, ctx: &FetchContext) -> anyhow::Result<()> {
        let Some(step) = &self.dependencies else {
            return Ok(());
        };
        step.run(dir, &dir.join(&self.settings.manifest), ctx)
            .context("dependency install failed")
    }

    /// Fetch, validate and register the module at `url`.
    pub fn install(&self, url: &str, cancel: &CancelToken) -> Result<ModuleRecord> {
        let source = ModuleSource::parse(url)?;
        let name = source.name.as_str();
        let _guard = self.locks.try_acquire(name)?;

        if let Some(existing) = self.registry.get(name)? {
            match existing.status {
                ModuleStatus::Installed | ModuleStatus::Updating => {
                    if existing.source_url == source.url {
                        log::info!("module {} already installed at {}", name, existing.revision);
                        return Ok(existing);
                    }
                    return Err(KernelError::install(
                        name,
                        anyhow!("name is already taken by {}", existing.source_url),
                    ));
                }
                ModuleStatus::Failed | ModuleStatus::Removed => {
                    log::warn!("clearing stale {} record for module {}", existing.status, name);
                    remove_tree(&existing.install_path);
                    self.registry.delete(name)?;
                }
            }
        }

        let dest = self.settings.module_root.join(name);
        if dest.exists() {
            log::warn!("removing unregistered directory {}", dest.display());
            remove_tree(&dest);
        }

        let staging_root = self.settings.module_root.join(STAGING_DIR);
        std::fs::create_dir_all(&staging_root)?;
        let staged = StagedDir {
            path: staging_root.join(name),
            committed: false,
        };
        remove_tree(&staged.path);

        log::info!("installing module {} from {}", name, source.url);
        let ctx = self.fetch_context(cancel);
        let revision = self
            .fetcher
            .clone_shallow(&source.url, &self.settings.branch, &staged.path, &ctx)
            .map_err(|e| self.map_fetch(name, e))?;
        self.validate_tree(&staged.path)
            .map_err(|e| KernelError::install(name, e))?;
        self.install_dependencies(&staged.path, &ctx)
            .map_err(|e| KernelError::install(name, e))?;
        if cancel.is_cancelled() {
            return Err(KernelError::Cancelled(name.to_string()));
        }

        std::fs::rename(&staged.path, &dest)
            .with_context(|| format!("failed to move module into {}", dest.display()))
            .map_err(|e| KernelError::install(name, e))?;
        staged.commit();

        let now = now_s();
        let record = ModuleRecord {
            name: name.to_string(),
            source_url: source.url.clone(),
            revision,
            install_path: dest.clone(),
            status: ModuleStatus::Installed,
            installed_at: now,
            updated_at: now,
        };
        if let Err(e) = self.registry.put(&record) {
            remove_tree(&dest);
            return Err(e);
        }
        log::info!("module {} installed at {}", name, record.revision);
        Ok(record)
    }

    /// Fast-forward an installed module to the latest remote revision.
    pub fn update(&self, name: &str, cancel: &CancelToken) -> Result<ModuleRecord> {
        let _guard = self.locks.try_acquire(name)?;
        let previous = self.lookup(name)?;

        let mut updating = previous.clone();
        updating.status = ModuleStatus::Updating;
        self.registry.put(&updating)?;

        let dir = previous.install_path.clone();
        let ctx = self.fetch_context(cancel);
        let advanced = self
            .fetcher
            .fetch(&dir, &self.settings.branch, &ctx)
            .and_then(|remote| {
                if cancel.is_cancelled() {
                    return Err(FetchError::Cancelled);
                }
                log::debug!("module {} remote head is {}", name, remote);
                self.fetcher.fast_forward(&dir, &self.settings.branch)
            });
        let revision = match advanced {
            Ok(revision) => revision,
            Err(e) => {
                self.registry.put(&previous)?;
                let err = self.map_fetch(name, e);
                log::warn!("module {} not updated: {}", name, err);
                return Err(err);
            }
        };

        let mut record = previous.clone();
        record.revision = revision;
        record.updated_at = now_s();
        let checked = self
            .validate_tree(&dir)
            .and_then(|_| self.install_dependencies(&dir, &ctx));
        if let Err(e) = checked {
            record.status = ModuleStatus::Failed;
            self.registry.put(&record)?;
            return Err(KernelError::install(name, e));
        }

        record.status = ModuleStatus::Installed;
        self.registry.put(&record)?;
        if record.revision == previous.revision {
            log::info!("module {} already up to date", name);
        } else {
            log::info!(
                "module {} updated {} -> {}",
                name,
                previous.revision,
                record.revision
            );
        }
        Ok(record)
    }

    /// Delete the module directory, then its record.
    pub fn remove(&self, name: &str) -> Result<()> {
        let _guard = self.locks.try_acquire(name)?;
        let mut record = self.lookup(name)?;

        record.status = ModuleStatus::Removed;
        record.updated_at = now_s();
        self.registry.put(&record)?;

        match std::fs::remove_dir_all(&record.install_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(KernelError::Storage(anyhow!(
                    "failed to delete {}: {}",
                    record.install_path.display(),
                    e
                )))
            }
        }
        self.registry.delete(name)?;
        log::info!("module {} removed", name);
        Ok(())
    }

    /// Snapshot of known modules ordered by install time.
    pub fn list_installed(&self) -> Result<Vec<ModuleRecord>> {
        Ok(self
            .registry
            .list()?
            .into_iter()
            .filter(|r| r.status != ModuleStatus::Removed)
            .collect())
    }

    pub fn info(&self, name: &str) -> Result<ModuleInfo> {
        let record = self.lookup(name)?;
        let repo = match self.fetcher.status(&record.install_path, &self.settings.branch) {
            Ok(status) => Some(status),
            Err(e) => {
                log::warn!("module {} repository status unavailable: {}", name, e);
                None
            }
        };
        let changelog = std::fs::read_to_string(record.install_path.join(&self.settings.changelog))
            .unwrap_or_else(|_| CHANGELOG_MISSING.to_string());
        Ok(ModuleInfo {
            record,
            repo,
            changelog,
        })
    }

    fn lookup(&self, name: &str) -> Result<ModuleRecord> {
        validate_module_name(name)?;
        match self.registry.get(name)? {
            Some(record) if record.status != ModuleStatus::Removed => Ok(record),
            _ => Err(KernelError::NotFound(name.to_string())),
        }
    }

    /// Repair state left behind by a crash. Run before serving requests.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let staging_root = self.settings.module_root.join(STAGING_DIR);
        if staging_root.exists() {
            remove_tree(&staging_root);
            report.staging_cleared = true;
        }

        let mut known = HashSet::new();
        for mut record in self.registry.list()? {
            let present = record.install_path.is_dir();
            match record.status {
                ModuleStatus::Removed => {
                    remove_tree(&record.install_path);
                    self.registry.delete(&record.name)?;
                    report.removals_completed.push(record.name);
                    continue;
                }
                _ if !present => {
                    self.registry.delete(&record.name)?;
                    report.missing_dropped.push(record.name);
                    continue;
                }
                ModuleStatus::Updating => {
                    let valid = self.validate_tree(&record.install_path).is_ok();
                    match self.fetcher.head(&record.install_path) {
                        Ok(head) if valid => {
                            record.revision = head;
                            record.status = ModuleStatus::Installed;
                        }
                        _ => record.status = ModuleStatus::Failed,
                    }
                    record.updated_at = now_s();
                    self.registry.put(&record)?;
                    report.updates_resolved.push(record.name.clone());
                }
                ModuleStatus::Installed | ModuleStatus::Failed => {}
            }
            known.insert(record.name);
        }

        if self.settings.module_root.is_dir() {
            for entry in std::fs::read_dir(&self.settings.module_root)? {
                let entry = entry?;
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if file_name.starts_with('.') || !entry.path().is_dir() {
                    continue;
                }
                if !known.contains(&file_name) {
                    log::warn!("removing orphaned module directory {}", entry.path().display());
                    remove_tree(&entry.path());
                    report.orphans_removed.push(file_name);
                }
            }
        }

        if report != RecoveryReport::default() {
            log::warn!("installer recovery: {:?}", report);
        }
        Ok(report)
    }
}
