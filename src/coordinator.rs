//! Lifecycle coordinator: the operator command surface.
//!
//! Mutating verbs require the administrative role, run the installer and then
//! hand off to the supervisor through the restart mailbox without waiting for
//! the relaunch. Read-only verbs never touch the supervisor.

use anyhow::anyhow;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::archive::{write_snapshot, ArchiveFilter, ArchiveSummary};
use crate::config::KernelConfig;
use crate::installer::{
    validate_module_name, CancelToken, DependencyStep, FetchContext, FetchError, ModuleInfo,
    ModuleInstaller, ModuleSource, RepoStatus, SourceFetcher,
};
use crate::registry::{ModuleRecord, ModuleRegistry};
use crate::sandbox::{PolicyDocument, Sandbox};
use crate::signal::{RestartMailbox, RestartRequest, SendOutcome};
use crate::supervisor::SupervisorStatus;
use crate::{now_s, KernelError, Result};

/// The single role that covers every privileged verb.
pub const ADMIN_ROLE: &str = "admin";

const KERNEL_NAME: &str = "kernel";
const LOCK_DIR: &str = "locks";
const CANCEL_DIR: &str = "cancel";
const OPERATOR_LOCK_FILE: &str = "operator.lock";
const LOCK_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
    pub roles: BTreeSet<String>,
}

impl Caller {
    pub fn anonymous(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: BTreeSet::new(),
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        let mut caller = Self::anonymous(id);
        caller.roles.insert(ADMIN_ROLE.to_string());
        caller
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

pub trait Authorizer: Send + Sync {
    /// Resolve the caller's roles from the credential it presented.
    fn authorize(&self, id: &str, token: Option<&str>) -> Caller;
}

/// Grants [`ADMIN_ROLE`] to callers presenting the operator token.
///
/// Only the SHA-256 digest of the stored token is kept in memory.
pub struct TokenAuthorizer {
    digest: Option<[u8; 32]>,
}

impl TokenAuthorizer {
    pub fn from_token(token: &str) -> Self {
        Self {
            digest: Some(digest(token)),
        }
    }

    /// Nobody is an administrator.
    pub fn deny_all() -> Self {
        Self { digest: None }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            KernelError::Config(format!("failed to read admin token {}: {}", path.display(), e))
        })?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(KernelError::Config(format!(
                "admin token file {} is empty",
                path.display()
            )));
        }
        Ok(Self::from_token(token))
    }

    /// A fresh 32-byte token, hex encoded.
    pub fn generate_token() -> String {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    pub fn write_token_file(path: &Path, token: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{token}\n"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

impl Authorizer for TokenAuthorizer {
    fn authorize(&self, id: &str, token: Option<&str>) -> Caller {
        match (self.digest, token) {
            (Some(expected), Some(token)) if digest(token.trim()) == expected => Caller::admin(id),
            _ => Caller::anonymous(id),
        }
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Reject a privileged `command` from a caller without the admin role.
///
/// Pure: callers run it before touching the filesystem.
pub fn authorize(caller: &Caller, command: &OperatorCommand) -> Result<()> {
    if command.is_privileged() && !caller.has_role(ADMIN_ROLE) {
        log::warn!(
            "permission denied: caller {} attempted {}",
            caller.id,
            command.verb()
        );
        return Err(KernelError::PermissionDenied(format!(
            "{} requires the {ADMIN_ROLE} role",
            command.verb()
        )));
    }
    Ok(())
}

/// What a privileged command holds exclusively across processes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockScope {
    Module(String),
    Kernel,
}

impl LockScope {
    fn file_name(&self) -> String {
        match self {
            LockScope::Module(name) => format!("module-{name}.lock"),
            LockScope::Kernel => format!("{KERNEL_NAME}.lock"),
        }
    }

    fn subject(&self) -> &str {
        match self {
            LockScope::Module(name) => name,
            LockScope::Kernel => KERNEL_NAME,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperatorCommand {
    ModuleLoad { url: String },
    ModuleUnload { name: String },
    ModuleUpdate { name: String },
    ModuleInfo { name: String },
    ModuleList,
    KernelInfo,
    KernelUpdate,
    DebugDownload,
    DebugReboot,
    DebugExport,
}

impl OperatorCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            OperatorCommand::ModuleLoad { .. } => "module load",
            OperatorCommand::ModuleUnload { .. } => "module unload",
            OperatorCommand::ModuleUpdate { .. } => "module update",
            OperatorCommand::ModuleInfo { .. } => "module info",
            OperatorCommand::ModuleList => "module list",
            OperatorCommand::KernelInfo => "kernel info",
            OperatorCommand::KernelUpdate => "kernel update",
            OperatorCommand::DebugDownload => "debug download",
            OperatorCommand::DebugReboot => "debug reboot",
            OperatorCommand::DebugExport => "debug export",
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(
            self,
            OperatorCommand::ModuleLoad { .. }
                | OperatorCommand::ModuleUnload { .. }
                | OperatorCommand::ModuleUpdate { .. }
                | OperatorCommand::KernelUpdate
                | OperatorCommand::DebugReboot
        )
    }

    /// The lock a privileged command takes. Validates the module name or
    /// URL, so malformed input is rejected before anything is created.
    pub fn lock_scope(&self) -> Result<Option<LockScope>> {
        match self {
            OperatorCommand::ModuleLoad { url } => {
                Ok(Some(LockScope::Module(ModuleSource::parse(url)?.name)))
            }
            OperatorCommand::ModuleUnload { name } | OperatorCommand::ModuleUpdate { name } => {
                validate_module_name(name)?;
                Ok(Some(LockScope::Module(name.clone())))
            }
            OperatorCommand::KernelUpdate => Ok(Some(LockScope::Kernel)),
            _ => Ok(None),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct KernelInfo {
    pub version: String,
    pub repo: Option<RepoStatus>,
    pub modules: usize,
    pub supervisor: Option<SupervisorStatus>,
    pub pending_restart: Option<RestartRequest>,
}

/// Structured result of a successful command.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The change is durable; the supervisor will relaunch asynchronously.
    RestartPending {
        verb: String,
        module: Option<ModuleRecord>,
        revision: Option<String>,
        restart: SendOutcome,
    },
    /// An in-flight install was cancelled before anything was committed.
    InstallCancelled { name: String },
    ModuleInfo(ModuleInfo),
    ModuleList { modules: Vec<ModuleRecord> },
    KernelInfo(KernelInfo),
    Archive(ArchiveSummary),
    Export(serde_json::Value),
}

#[derive(Clone, Debug)]
pub struct CoordinatorSettings {
    /// The kernel's own working tree, a git checkout.
    pub work_dir: PathBuf,
    pub branch: String,
    pub fetch_timeout: Duration,
    pub policy: PolicyDocument,
    pub secrets_file: String,
    pub download_dir: PathBuf,
}

#[derive(Default)]
struct InFlight {
    tokens: Mutex<HashMap<String, CancelToken>>,
    finished: Condvar,
}

pub struct LifecycleCoordinator {
    installer: ModuleInstaller,
    mailbox: RestartMailbox,
    settings: CoordinatorSettings,
    in_flight: InFlight,
    kernel_update: Mutex<()>,
}

impl LifecycleCoordinator {
    pub fn new(
        installer: ModuleInstaller,
        mailbox: RestartMailbox,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            installer,
            mailbox,
            settings,
            in_flight: InFlight::default(),
            kernel_update: Mutex::new(()),
        }
    }

    /// Wire the coordinator from config: registry, installer (with the
    /// sandboxed dependency step when configured) and restart mailbox.
    pub fn from_config(cfg: &KernelConfig, fetcher: Box<dyn SourceFetcher>) -> Result<Self> {
        std::fs::create_dir_all(&cfg.module_root)?;
        let policy = cfg.render_policy()?;
        let registry = Arc::new(ModuleRegistry::open(&cfg.registry_path)?);
        let mut installer = ModuleInstaller::new(registry, fetcher, cfg.installer_settings());
        if let Some(command) = &cfg.modules.dependency_install {
            installer = installer.with_dependency_step(DependencyStep {
                sandbox: Sandbox::default(),
                policy: policy.clone(),
                command: command.clone(),
            });
        }
        let settings = CoordinatorSettings {
            work_dir: cfg.work_dir.clone(),
            branch: cfg.modules.branch.clone(),
            fetch_timeout: cfg.modules.fetch_timeout,
            policy: policy.document(),
            secrets_file: cfg.secrets_file.clone(),
            download_dir: std::env::temp_dir(),
        };
        Ok(Self::new(
            installer,
            RestartMailbox::new(&cfg.signal_dir),
            settings,
        ))
    }

    pub fn installer(&self) -> &ModuleInstaller {
        &self.installer
    }

    pub fn mailbox(&self) -> &RestartMailbox {
        &self.mailbox
    }

    /// Run one operator command on behalf of `caller`.
    pub fn execute(&self, caller: &Caller, command: OperatorCommand) -> Result<CommandOutcome> {
        let verb = command.verb();
        authorize(caller, &command)?;
        log::debug!("caller {} runs {}", caller.id, verb);

        match command {
            OperatorCommand::ModuleLoad { url } => {
                let record = self.load(&url)?;
                self.restart_pending(caller, verb, Some(record), None)
            }
            OperatorCommand::ModuleUnload { name } => self.unload(caller, &name),
            OperatorCommand::ModuleUpdate { name } => {
                validate_module_name(&name)?;
                self.clear_cancel_marker(&name);
                let cancel = CancelToken::watching(self.cancel_marker(&name));
                let record = self.installer.update(&name, &cancel)?;
                self.restart_pending(caller, verb, Some(record), None)
            }
            OperatorCommand::ModuleInfo { name } => {
                Ok(CommandOutcome::ModuleInfo(self.installer.info(&name)?))
            }
            OperatorCommand::ModuleList => Ok(CommandOutcome::ModuleList {
                modules: self.installer.list_installed()?,
            }),
            OperatorCommand::KernelInfo => Ok(CommandOutcome::KernelInfo(self.kernel_info()?)),
            OperatorCommand::KernelUpdate => {
                let revision = self.update_kernel()?;
                self.restart_pending(caller, verb, None, Some(revision))
            }
            OperatorCommand::DebugDownload => Ok(CommandOutcome::Archive(self.download()?)),
            OperatorCommand::DebugReboot => self.restart_pending(caller, verb, None, None),
            OperatorCommand::DebugExport => Ok(CommandOutcome::Export(self.export()?)),
        }
    }

    /// Run `command` with exclusion against other operator processes.
    ///
    /// Privileged commands hold the operator lock shared plus a lock scoped
    /// to their module (or the kernel tree), so different names proceed in
    /// parallel. The operator that finds nobody else active first repairs
    /// crash leftovers. An unload whose module is busy asks the holder to
    /// cancel through a marker file and waits for the scope lock.
    pub fn execute_exclusive(
        &self,
        caller: &Caller,
        command: OperatorCommand,
    ) -> Result<CommandOutcome> {
        authorize(caller, &command)?;
        if !command.is_privileged() {
            return self.execute(caller, command);
        }
        let scope = command.lock_scope()?;
        let signal_dir = self.mailbox.dir().to_path_buf();
        let _operator = self.enter_operator(&signal_dir)?;
        let Some(scope) = scope else {
            return self.execute(caller, command);
        };

        let unloading = match &command {
            OperatorCommand::ModuleUnload { name } => Some(name.clone()),
            _ => None,
        };
        let (_scoped, superseded) = match ScopeLock::try_acquire(&signal_dir, &scope) {
            Ok(lock) => (lock, false),
            Err(KernelError::AlreadyInProgress(_)) => match &unloading {
                Some(name) => (self.supersede(&signal_dir, &scope, name)?, true),
                None => return Err(KernelError::AlreadyInProgress(scope.subject().to_string())),
            },
            Err(e) => return Err(e),
        };

        let result = self.execute(caller, command);
        match unloading {
            Some(name) if superseded => {
                self.clear_cancel_marker(&name);
                match result {
                    Err(KernelError::NotFound(_)) => {
                        log::info!("unload of {} superseded an install in another process", name);
                        Ok(CommandOutcome::InstallCancelled { name })
                    }
                    other => other,
                }
            }
            _ => result,
        }
    }

    /// Shared operator lock; whoever gets it exclusively runs recovery first.
    fn enter_operator(&self, signal_dir: &Path) -> Result<OperatorLock> {
        match OperatorLock::try_exclusive(signal_dir) {
            Ok(lock) => {
                let report = self.installer.recover()?;
                log::debug!("operator recovery: {:?}", report);
                lock.downgrade()
            }
            Err(KernelError::AlreadyInProgress(_)) => OperatorLock::shared(signal_dir),
            Err(e) => Err(e),
        }
    }

    /// Signal the holder of `name`'s scope lock to cancel, then wait for it.
    fn supersede(&self, signal_dir: &Path, scope: &LockScope, name: &str) -> Result<ScopeLock> {
        let marker = self.cancel_marker(name);
        if let Some(parent) = marker.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&marker, b"")?;
        log::info!("module {} is busy in another process; requesting cancellation", name);

        let deadline = Instant::now() + self.settings.fetch_timeout + Duration::from_secs(5);
        loop {
            match ScopeLock::try_acquire(signal_dir, scope) {
                Ok(lock) => return Ok(lock),
                Err(KernelError::AlreadyInProgress(_)) if Instant::now() < deadline => {
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => {
                    self.clear_cancel_marker(name);
                    return Err(e);
                }
            }
        }
    }

    fn cancel_marker(&self, name: &str) -> PathBuf {
        self.mailbox
            .dir()
            .join(CANCEL_DIR)
            .join(format!("{name}.cancel"))
    }

    fn clear_cancel_marker(&self, name: &str) {
        match std::fs::remove_file(self.cancel_marker(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to clear cancel marker for {}: {}", name, e),
        }
    }

    fn restart_pending(
        &self,
        caller: &Caller,
        verb: &str,
        module: Option<ModuleRecord>,
        revision: Option<String>,
    ) -> Result<CommandOutcome> {
        let restart = self.mailbox.send(verb, &caller.id)?;
        Ok(CommandOutcome::RestartPending {
            verb: verb.to_string(),
            module,
            revision,
            restart,
        })
    }

    fn load(&self, url: &str) -> Result<ModuleRecord> {
        let source = ModuleSource::parse(url)?;
        self.clear_cancel_marker(&source.name);
        let token = CancelToken::watching(self.cancel_marker(&source.name));
        {
            let mut tokens = self.lock_in_flight()?;
            if tokens.contains_key(&source.name) {
                return Err(KernelError::AlreadyInProgress(source.name));
            }
            tokens.insert(source.name.clone(), token.clone());
        }
        let result = self.installer.install(url, &token);
        if let Ok(mut tokens) = self.in_flight.tokens.lock() {
            tokens.remove(&source.name);
        }
        self.in_flight.finished.notify_all();
        result
    }

    fn unload(&self, caller: &Caller, name: &str) -> Result<CommandOutcome> {
        let cancelled = self.cancel_in_flight(name)?;
        match self.installer.remove(name) {
            Ok(()) => self.restart_pending(caller, "module unload", None, None),
            Err(KernelError::NotFound(_)) if cancelled => {
                log::info!("unload of {} superseded its in-flight install", name);
                Ok(CommandOutcome::InstallCancelled {
                    name: name.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel an in-flight install of `name` and wait for it to unwind.
    fn cancel_in_flight(&self, name: &str) -> Result<bool> {
        let mut tokens = self.lock_in_flight()?;
        let Some(token) = tokens.get(name) else {
            return Ok(false);
        };
        log::info!("cancelling in-flight install of {}", name);
        token.cancel();
        let bound = self.settings.fetch_timeout + Duration::from_secs(5);
        let (tokens, timeout) = self
            .in_flight
            .finished
            .wait_timeout_while(tokens, bound, |t| t.contains_key(name))
            .map_err(|_| KernelError::Storage(anyhow!("in-flight table poisoned")))?;
        drop(tokens);
        if timeout.timed_out() {
            return Err(KernelError::AlreadyInProgress(name.to_string()));
        }
        Ok(true)
    }

    fn lock_in_flight(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, CancelToken>>> {
        self.in_flight
            .tokens
            .lock()
            .map_err(|_| KernelError::Storage(anyhow!("in-flight table poisoned")))
    }

    fn update_kernel(&self) -> Result<String> {
        let _guard = self
            .kernel_update
            .try_lock()
            .map_err(|_| KernelError::AlreadyInProgress(KERNEL_NAME.to_string()))?;
        let fetcher = self.installer.fetcher();
        let dir = &self.settings.work_dir;
        let branch = &self.settings.branch;
        let ctx = FetchContext::new(self.settings.fetch_timeout, CancelToken::new());
        let revision = fetcher
            .fetch(dir, branch, &ctx)
            .and_then(|_| fetcher.fast_forward(dir, branch))
            .map_err(|e| match e {
                FetchError::Timeout { what, secs } => KernelError::FetchTimeout { what, secs },
                FetchError::NotFastForward(reason) => KernelError::UpdateConflict {
                    name: KERNEL_NAME.to_string(),
                    reason,
                },
                FetchError::Cancelled => KernelError::Cancelled(KERNEL_NAME.to_string()),
                FetchError::Failed(source) => KernelError::install(KERNEL_NAME, source),
            })?;
        log::info!("kernel working tree now at {}", revision);
        Ok(revision)
    }

    fn kernel_info(&self) -> Result<KernelInfo> {
        let repo = match self
            .installer
            .fetcher()
            .status(&self.settings.work_dir, &self.settings.branch)
        {
            Ok(status) => Some(status),
            Err(e) => {
                log::warn!("kernel repository status unavailable: {}", e);
                None
            }
        };
        Ok(KernelInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            repo,
            modules: self.installer.list_installed()?.len(),
            supervisor: SupervisorStatus::read(self.mailbox.dir())?,
            pending_restart: self.mailbox.pending()?,
        })
    }

    fn download(&self) -> Result<ArchiveSummary> {
        std::fs::create_dir_all(&self.settings.download_dir)?;
        let dest = self
            .settings
            .download_dir
            .join(format!("kernel-snapshot-{}.tar.gz", now_s()));
        write_snapshot(
            &self.settings.work_dir,
            &dest,
            &ArchiveFilter::new(&self.settings.secrets_file),
        )
    }

    fn export(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "generated_at": now_s(),
            "version": env!("CARGO_PKG_VERSION"),
            "modules": self.installer.registry().list()?,
            "policy": self.settings.policy,
            "supervisor": SupervisorStatus::read(self.mailbox.dir())?,
            "pending_restart": self.mailbox.pending()?,
        }))
    }
}

/// Cross-process exclusion between operator commands and recovery.
///
/// Operator commands hold it shared; startup recovery holds it exclusively.
/// Lives at `<signal_dir>/locks/operator.lock` and is released on drop.
pub struct OperatorLock {
    file: File,
}

impl OperatorLock {
    /// Exclusive, failing fast with `AlreadyInProgress` while anyone holds it.
    pub fn try_exclusive(signal_dir: &Path) -> Result<Self> {
        let file = open_lock_file(signal_dir, OPERATOR_LOCK_FILE)?;
        if !flock(&file, LockMode::Exclusive, false)? {
            return Err(KernelError::AlreadyInProgress("operator recovery".to_string()));
        }
        Ok(Self { file })
    }

    /// Shared; waits while recovery holds it exclusively.
    pub fn shared(signal_dir: &Path) -> Result<Self> {
        let file = open_lock_file(signal_dir, OPERATOR_LOCK_FILE)?;
        flock(&file, LockMode::Shared, true)?;
        Ok(Self { file })
    }

    pub fn downgrade(self) -> Result<Self> {
        flock(&self.file, LockMode::Shared, true)?;
        Ok(self)
    }
}

/// Exclusive per-module (or kernel tree) lock file under `<signal_dir>/locks`.
pub struct ScopeLock {
    _file: File,
}

impl ScopeLock {
    pub fn try_acquire(signal_dir: &Path, scope: &LockScope) -> Result<Self> {
        let file = open_lock_file(signal_dir, &scope.file_name())?;
        if !flock(&file, LockMode::Exclusive, false)? {
            return Err(KernelError::AlreadyInProgress(scope.subject().to_string()));
        }
        Ok(Self { _file: file })
    }
}

#[derive(Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

fn open_lock_file(signal_dir: &Path, name: &str) -> Result<File> {
    let dir = signal_dir.join(LOCK_DIR);
    std::fs::create_dir_all(&dir)?;
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(name))?)
}

/// Returns false when a non-blocking request would have blocked.
#[cfg(unix)]
fn flock(file: &File, mode: LockMode, wait: bool) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let mut op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };
    if !wait {
        op |= libc::LOCK_NB;
    }
    loop {
        // SAFETY: flock on a descriptor owned by `file` for the duration of the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) if !wait => return Ok(false),
            Some(libc::EINTR) => continue,
            _ => return Err(err.into()),
        }
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _mode: LockMode, _wait: bool) -> Result<bool> {
    Ok(true)
}
