use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::installer::InstallerSettings;
use crate::sandbox::{render_policy, BasePaths, NetworkProtocol, PolicySettings, SandboxPolicy};
use crate::supervisor::{RestartPolicy, SupervisorSettings};
use crate::{KernelError, Result};

const DEFAULT_MODULE_DIR: &str = "extensions";
const DEFAULT_SIGNAL_DIR: &str = ".restart";
const DEFAULT_REGISTRY_FILE: &str = "modules.db";
const DEFAULT_SECRETS_FILE: &str = ".env";
const DEFAULT_INTERPRETER: &str = "/usr/bin/python3";
const DEFAULT_LAUNCH_NAME: &str = "kernel";
const DEFAULT_LAUNCH_SCRIPT: &str = "launcher.py";
const DEFAULT_BRANCH: &str = "master";
const DEFAULT_MANIFEST: &str = "requirements.txt";
const DEFAULT_ENTRY_POINT: &str = "main.py";
const DEFAULT_CHANGELOG: &str = "CHANGELOG";
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 120;
const DEFAULT_GRACE_SECS: u64 = 10;
const DEFAULT_WATCH_DELAY_SECS: u64 = 3;
const DEFAULT_READY_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct KernelConfigFile {
    home_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    module_root: Option<PathBuf>,
    signal_dir: Option<PathBuf>,
    registry_path: Option<String>,
    config_dir: Option<PathBuf>,
    secrets_file: Option<String>,
    admin_token_path: Option<PathBuf>,
    launch: Option<LaunchConfigFile>,
    sandbox: Option<SandboxConfigFile>,
    modules: Option<ModulesConfigFile>,
    restart: Option<RestartConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LaunchConfigFile {
    name: Option<String>,
    command: Option<Vec<String>>,
    ready_line: Option<String>,
    log_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SandboxConfigFile {
    interpreters: Option<Vec<PathBuf>>,
    protocols: Option<Vec<String>>,
    extra_read_write: Option<Vec<PathBuf>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ModulesConfigFile {
    branch: Option<String>,
    manifest: Option<String>,
    entry_point: Option<String>,
    changelog: Option<String>,
    fetch_timeout_secs: Option<u64>,
    dependency_install: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RestartConfigFile {
    base_backoff_secs: Option<u64>,
    max_backoff_secs: Option<u64>,
    max_restarts: Option<usize>,
    window_secs: Option<u64>,
    grace_secs: Option<u64>,
    watch_delay_secs: Option<u64>,
    ready_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub home_dir: PathBuf,
    pub work_dir: PathBuf,
    pub module_root: PathBuf,
    pub signal_dir: PathBuf,
    pub registry_path: String,
    /// Directory outside the code tree holding the secrets file.
    pub config_dir: Option<PathBuf>,
    /// File name of the secrets file, relative to `config_dir` and `work_dir`.
    pub secrets_file: String,
    pub admin_token_path: Option<PathBuf>,
    pub launch: LaunchSettings,
    pub sandbox: PolicySettings,
    pub modules: ModuleSettings,
    pub restart: RestartPolicy,
    pub grace_period: Duration,
    pub watch_delay: Duration,
    pub ready_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub name: String,
    /// argv of the supervised process; the first entry is an interpreter.
    pub command: Vec<String>,
    pub ready_line: Option<String>,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ModuleSettings {
    pub branch: String,
    pub manifest: String,
    pub entry_point: String,
    pub changelog: String,
    pub fetch_timeout: Duration,
    pub dependency_install: Option<Vec<String>>,
}

impl KernelConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("KERNEL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults rooted at `work_dir`, without reading the environment.
    pub fn rooted_at(home_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut cfg = Self::from_file(KernelConfigFile {
            home_dir: Some(home_dir.into()),
            work_dir: Some(work_dir.into()),
            ..KernelConfigFile::default()
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: KernelConfigFile) -> Result<Self> {
        let home_dir = match file.home_dir {
            Some(home) => home,
            None => std::env::var_os("HOME")
                .map(PathBuf::from)
                .ok_or_else(|| KernelError::Config("HOME is not set and home_dir is missing".into()))?,
        };
        let work_dir = match file.work_dir {
            Some(dir) => dir,
            None => std::env::current_dir()
                .map_err(|e| KernelError::Config(format!("cannot resolve working dir: {e}")))?,
        };
        let module_root = file
            .module_root
            .unwrap_or_else(|| work_dir.join(DEFAULT_MODULE_DIR));
        let signal_dir = file
            .signal_dir
            .unwrap_or_else(|| work_dir.join(DEFAULT_SIGNAL_DIR));
        let registry_path = file
            .registry_path
            .unwrap_or_else(|| work_dir.join(DEFAULT_REGISTRY_FILE).to_string_lossy().into_owned());

        let launch_file = file.launch.unwrap_or_default();
        let launch = LaunchSettings {
            name: launch_file
                .name
                .unwrap_or_else(|| DEFAULT_LAUNCH_NAME.to_string()),
            command: launch_file.command.unwrap_or_else(|| {
                vec![
                    DEFAULT_INTERPRETER.to_string(),
                    DEFAULT_LAUNCH_SCRIPT.to_string(),
                ]
            }),
            ready_line: launch_file.ready_line,
            log_path: launch_file.log_path,
        };

        let sandbox_file = file.sandbox.unwrap_or_default();
        let defaults = PolicySettings::default();
        let protocols = match sandbox_file.protocols {
            Some(names) => names
                .iter()
                .map(|name| NetworkProtocol::parse(name))
                .collect::<Result<Vec<_>>>()?,
            None => defaults.protocols,
        };
        let sandbox = PolicySettings {
            interpreters: sandbox_file.interpreters.unwrap_or(defaults.interpreters),
            protocols,
            extra_read_write: sandbox_file.extra_read_write.unwrap_or_default(),
            denied_files: Vec::new(),
        };

        let modules_file = file.modules.unwrap_or_default();
        let modules = ModuleSettings {
            branch: modules_file
                .branch
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            manifest: modules_file
                .manifest
                .unwrap_or_else(|| DEFAULT_MANIFEST.to_string()),
            entry_point: modules_file
                .entry_point
                .unwrap_or_else(|| DEFAULT_ENTRY_POINT.to_string()),
            changelog: modules_file
                .changelog
                .unwrap_or_else(|| DEFAULT_CHANGELOG.to_string()),
            fetch_timeout: Duration::from_secs(
                modules_file
                    .fetch_timeout_secs
                    .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
            ),
            dependency_install: modules_file.dependency_install,
        };

        let restart_file = file.restart.unwrap_or_default();
        let default_policy = RestartPolicy::default();
        let restart = RestartPolicy {
            base_backoff: restart_file
                .base_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(default_policy.base_backoff),
            max_backoff: restart_file
                .max_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(default_policy.max_backoff),
            max_restarts: restart_file
                .max_restarts
                .unwrap_or(default_policy.max_restarts),
            window: restart_file
                .window_secs
                .map(Duration::from_secs)
                .unwrap_or(default_policy.window),
        };
        let ready_timeout = match restart_file.ready_timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS)),
        };

        Ok(Self {
            home_dir,
            work_dir,
            module_root,
            signal_dir,
            registry_path,
            config_dir: file.config_dir,
            secrets_file: file
                .secrets_file
                .unwrap_or_else(|| DEFAULT_SECRETS_FILE.to_string()),
            admin_token_path: file.admin_token_path,
            launch,
            sandbox,
            modules,
            restart,
            grace_period: Duration::from_secs(restart_file.grace_secs.unwrap_or(DEFAULT_GRACE_SECS)),
            watch_delay: Duration::from_secs(
                restart_file
                    .watch_delay_secs
                    .unwrap_or(DEFAULT_WATCH_DELAY_SECS),
            ),
            ready_timeout,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(home) = env_path("KERNEL_HOME") {
            self.home_dir = home;
        }
        if let Some(work) = env_path("KERNEL_WORK_DIR") {
            // Derived paths follow the working dir unless set explicitly below.
            let old_work = std::mem::replace(&mut self.work_dir, work);
            rebase(&mut self.module_root, &old_work, &self.work_dir);
            rebase(&mut self.signal_dir, &old_work, &self.work_dir);
            let mut registry = PathBuf::from(&self.registry_path);
            rebase(&mut registry, &old_work, &self.work_dir);
            self.registry_path = registry.to_string_lossy().into_owned();
        }
        if let Some(root) = env_path("KERNEL_MODULE_ROOT") {
            self.module_root = root;
        }
        if let Some(dir) = env_path("KERNEL_SIGNAL_DIR") {
            self.signal_dir = dir;
        }
        if let Ok(path) = std::env::var("KERNEL_REGISTRY_PATH") {
            if !path.trim().is_empty() {
                self.registry_path = path;
            }
        }
        if let Some(path) = env_path("KERNEL_ADMIN_TOKEN_PATH") {
            self.admin_token_path = Some(path);
        }
        if let Ok(timeout) = std::env::var("KERNEL_FETCH_TIMEOUT_SECS") {
            let seconds: u64 = timeout.trim().parse().map_err(|_| {
                KernelError::Config(
                    "KERNEL_FETCH_TIMEOUT_SECS must be an integer number of seconds".into(),
                )
            })?;
            self.modules.fetch_timeout = Duration::from_secs(seconds);
        }
        if let Ok(protocols) = std::env::var("KERNEL_PROTOCOLS") {
            let parsed = split_csv(&protocols);
            if !parsed.is_empty() {
                self.sandbox.protocols = parsed
                    .iter()
                    .map(|name| NetworkProtocol::parse(name))
                    .collect::<Result<Vec<_>>>()?;
            }
        }
        if let Ok(max) = std::env::var("KERNEL_MAX_RESTARTS") {
            self.restart.max_restarts = max.trim().parse().map_err(|_| {
                KernelError::Config("KERNEL_MAX_RESTARTS must be a non-negative integer".into())
            })?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        for (what, path) in [
            ("home_dir", &self.home_dir),
            ("work_dir", &self.work_dir),
            ("module_root", &self.module_root),
            ("signal_dir", &self.signal_dir),
        ] {
            require_absolute(what, path)?;
        }
        if let Some(dir) = &self.config_dir {
            require_absolute("config_dir", dir)?;
        }
        if self.registry_path.trim().is_empty() {
            return Err(KernelError::Config("registry_path must not be empty".into()));
        }
        if self.module_root == self.work_dir {
            return Err(KernelError::Config(
                "module_root must be a subdirectory, not the working dir itself".into(),
            ));
        }
        require_file_name("secrets_file", &self.secrets_file)?;
        require_file_name("modules.manifest", &self.modules.manifest)?;
        require_file_name("modules.entry_point", &self.modules.entry_point)?;
        require_file_name("modules.changelog", &self.modules.changelog)?;
        if self.modules.branch.trim().is_empty() || self.modules.branch.starts_with('-') {
            return Err(KernelError::Config(format!(
                "invalid module branch '{}'",
                self.modules.branch
            )));
        }
        if self.modules.fetch_timeout.is_zero() {
            return Err(KernelError::Config("fetch timeout must be greater than zero".into()));
        }
        if let Some(cmd) = &self.modules.dependency_install {
            if cmd.is_empty() {
                return Err(KernelError::Config(
                    "modules.dependency_install must not be empty when set".into(),
                ));
            }
        }
        if self.restart.max_restarts == 0 {
            return Err(KernelError::Config("max_restarts must be at least 1".into()));
        }
        if self.restart.base_backoff.is_zero() || self.restart.max_backoff < self.restart.base_backoff
        {
            return Err(KernelError::Config(
                "restart backoff must be positive and capped at or above its base".into(),
            ));
        }
        if self.restart.window.is_zero() {
            return Err(KernelError::Config("restart window must be greater than zero".into()));
        }

        let Some(program) = self.launch.command.first() else {
            return Err(KernelError::Config("launch.command must not be empty".into()));
        };
        let program = Path::new(program);
        if program.is_absolute() && !self.sandbox.interpreters.iter().any(|i| i == program) {
            return Err(KernelError::Config(format!(
                "launch interpreter {} is not allow-listed",
                program.display()
            )));
        }
        self.sandbox.protocols.sort();
        self.sandbox.protocols.dedup();
        Ok(())
    }

    pub fn base_paths(&self) -> BasePaths {
        BasePaths {
            home: self.home_dir.clone(),
            module_root: self.module_root.clone(),
            work_dir: self.work_dir.clone(),
        }
    }

    /// Sandbox settings with the secrets file denied to the sandboxed tree.
    pub fn policy_settings(&self) -> PolicySettings {
        let mut settings = self.sandbox.clone();
        settings
            .denied_files
            .push(PathBuf::from(&self.secrets_file));
        if let Some(log_path) = &self.launch.log_path {
            if let Some(parent) = log_path.parent() {
                settings.extra_read_write.push(parent.to_path_buf());
            }
        }
        settings
    }

    pub fn render_policy(&self) -> Result<SandboxPolicy> {
        render_policy(&self.base_paths(), &self.policy_settings())
    }

    pub fn installer_settings(&self) -> InstallerSettings {
        InstallerSettings {
            module_root: self.module_root.clone(),
            branch: self.modules.branch.clone(),
            manifest: self.modules.manifest.clone(),
            entry_point: self.modules.entry_point.clone(),
            changelog: self.modules.changelog.clone(),
            fetch_timeout: self.modules.fetch_timeout,
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            restart: self.restart.clone(),
            grace_period: self.grace_period,
            watch_delay: self.watch_delay,
            ready_timeout: self.launch.ready_line.as_ref().and(self.ready_timeout),
            ..SupervisorSettings::default()
        }
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.work_dir.join(&self.secrets_file)
    }
}

fn read_config_file(path: &Path) -> Result<KernelConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        KernelError::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    let is_toml = path.extension().is_some_and(|ext| ext == "toml");
    let parsed = if is_toml {
        toml::from_str(&raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| KernelError::Config(format!("invalid config file {}: {}", path.display(), e)))
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn rebase(path: &mut PathBuf, old_root: &Path, new_root: &Path) {
    if let Ok(rest) = path.strip_prefix(old_root) {
        *path = new_root.join(rest);
    }
}

fn require_absolute(what: &str, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(KernelError::Config(format!("{what} is missing")));
    }
    if !path.is_absolute() {
        return Err(KernelError::Config(format!(
            "{what} must be absolute, got {}",
            path.display()
        )));
    }
    Ok(())
}

fn require_file_name(what: &str, name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(KernelError::Config(format!(
            "{what} must be a plain file name, got '{name}'"
        ))),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
