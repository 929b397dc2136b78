//! Launch contract: secrets hand-off, launcher assembly and the
//! process-manager descriptor.

use serde_json::json;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

use crate::config::KernelConfig;
use crate::sandbox::{allowed_interpreter, Sandbox, SandboxCommand, SandboxPolicy};
use crate::supervisor::SandboxedLauncher;
use crate::{KernelError, Result};

/// Bot credentials read once from a dotenv-style file.
///
/// Values are only ever handed to the sandboxed process through its
/// environment and are wiped on drop.
#[derive(Default)]
pub struct Secrets {
    entries: Vec<(String, String)>,
}

impl Secrets {
    pub fn load(path: &Path) -> Result<Self> {
        let mut raw = std::fs::read_to_string(path).map_err(|e| {
            KernelError::Config(format!("failed to read secrets file {}: {}", path.display(), e))
        })?;
        let parsed = Self::parse(&raw);
        raw.zeroize();
        parsed.map_err(|line| {
            KernelError::Config(format!(
                "malformed secrets file {} at line {}",
                path.display(),
                line
            ))
        })
    }

    /// Returns the offending 1-based line number on error. The line itself is
    /// never echoed.
    fn parse(raw: &str) -> std::result::Result<Self, usize> {
        let mut entries: Vec<(String, String)> = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=').ok_or(idx + 1)?;
            let key = key.trim();
            if !valid_env_key(key) {
                return Err(idx + 1);
            }
            let value = unquote(value.trim());
            entries.retain(|(k, _)| k != key);
            entries.push((key.to_string(), value.to_string()));
        }
        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("keys", &self.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Drop for Secrets {
    fn drop(&mut self) {
        for (_, value) in self.entries.iter_mut() {
            value.zeroize();
        }
    }
}

fn valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Copy the secrets file from `config_dir` into `work_dir` (mode 0600) and
/// keep it out of version control. Returns the copied path.
pub fn prepare_launch(config_dir: &Path, work_dir: &Path, secrets_name: &str) -> Result<PathBuf> {
    let source = config_dir.join(secrets_name);
    let dest = work_dir.join(secrets_name);
    let mut bytes = std::fs::read(&source).map_err(|e| {
        KernelError::Config(format!(
            "secrets file {} is not readable: {}",
            source.display(),
            e
        ))
    })?;
    let written = write_private(&dest, &bytes);
    bytes.zeroize();
    written?;
    ensure_gitignored(work_dir, secrets_name)?;
    log::info!("secrets file copied to {}", dest.display());
    Ok(dest)
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn ensure_gitignored(work_dir: &Path, name: &str) -> Result<()> {
    let path = work_dir.join(".gitignore");
    let existing = match std::fs::read_to_string(&path) {
        Ok(existing) => existing,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let anchored = format!("/{name}");
    if existing
        .lines()
        .map(str::trim)
        .any(|line| line == name || line == anchored)
    {
        return Ok(());
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    writeln!(file, "{anchored}")?;
    Ok(())
}

/// Assemble the launcher for the supervised process from config.
pub fn build_launcher(
    cfg: &KernelConfig,
    sandbox: Sandbox,
    policy: SandboxPolicy,
    secrets: Secrets,
) -> Result<SandboxedLauncher> {
    let (program, args) = cfg
        .launch
        .command
        .split_first()
        .ok_or_else(|| KernelError::Config("launch.command must not be empty".into()))?;
    let program = allowed_interpreter(&policy, program).ok_or_else(|| {
        KernelError::Config(format!("launch interpreter {program} is not allow-listed"))
    })?;
    let command = SandboxCommand::new(program, &cfg.work_dir).args(args.iter().cloned());
    Ok(SandboxedLauncher::new(
        sandbox,
        policy,
        command,
        secrets,
        cfg.launch.ready_line.clone(),
    ))
}

/// Descriptor for an external process manager that approximates the
/// supervisor: launch command, watched restart directory, watch delay and log.
pub fn render_descriptor(cfg: &KernelConfig) -> serde_json::Value {
    let (script, args) = match cfg.launch.command.split_first() {
        Some((script, args)) => (script.clone(), args.to_vec()),
        None => (String::new(), Vec::new()),
    };
    json!({
        "apps": [{
            "name": cfg.launch.name,
            "script": script,
            "args": args,
            "cwd": cfg.work_dir,
            "watch": [cfg.signal_dir],
            "watch_delay": cfg.watch_delay.as_millis() as u64,
            "ignore_watch": [cfg.module_root],
            "autorestart": true,
            "max_restarts": cfg.restart.max_restarts,
            "exp_backoff_restart_delay": cfg.restart.base_backoff.as_millis() as u64,
            "kill_timeout": cfg.grace_period.as_millis() as u64,
            "log_file": cfg.launch.log_path,
        }]
    })
}
