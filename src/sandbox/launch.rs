//! Launching commands under a rendered [`SandboxPolicy`].
//!
//! Enforcement is delegated to an external sandboxing helper (firejail by
//! default). If the helper is missing the launch fails with
//! `SandboxUnavailable`; there is no unsandboxed fallback. A privileged helper
//! (setuid firejail) sets no-new-privileges on the confined program itself;
//! unprivileged helpers get `PR_SET_NO_NEW_PRIVS` before exec.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use super::policy::{Directive, FsAccess, SandboxPolicy};
use crate::{KernelError, Result};

/// Environment forwarded to every sandboxed child. Nothing else is inherited.
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// A command to run inside the sandbox.
#[derive(Clone, Debug)]
pub struct SandboxCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub capture_output: bool,
}

impl SandboxCommand {
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
            capture_output: true,
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// An enforcement layer able to confine a command to a policy.
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Path to the helper binary, or `SandboxUnavailable`.
    fn locate(&self) -> Result<PathBuf>;

    /// Helper arguments that precede the confined program.
    fn arguments(&self, policy: &SandboxPolicy) -> Vec<String>;

    /// Whether the helper needs its own privileges (setuid) and applies
    /// no-new-privileges to the confined program itself. When false the
    /// helper is exec'd with `PR_SET_NO_NEW_PRIVS` already set.
    fn privileged_helper(&self) -> bool {
        false
    }
}

/// firejail-backed enforcement.
#[derive(Clone, Debug, Default)]
pub struct Firejail {
    binary: Option<PathBuf>,
}

impl Firejail {
    /// Use the firejail found on `PATH`.
    pub fn new() -> Self {
        Self { binary: None }
    }

    /// Use an explicit helper binary.
    pub fn at(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: Some(binary.into()),
        }
    }
}

impl SandboxBackend for Firejail {
    fn name(&self) -> &str {
        "firejail"
    }

    fn locate(&self) -> Result<PathBuf> {
        match &self.binary {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(KernelError::SandboxUnavailable(format!(
                "sandbox helper {} does not exist",
                path.display()
            ))),
            None => which::which("firejail").map_err(|e| {
                KernelError::SandboxUnavailable(format!("firejail not found on PATH: {e}"))
            }),
        }
    }

    fn arguments(&self, policy: &SandboxPolicy) -> Vec<String> {
        let mut args = vec!["--noprofile".to_string(), "--quiet".to_string()];
        for directive in policy.document().directives {
            match directive {
                Directive::Filesystem(rule) => {
                    let flag = match rule.access {
                        FsAccess::ReadWrite => "--read-write",
                        FsAccess::ReadOnly => "--read-only",
                        FsAccess::NoExec => "--noexec",
                        FsAccess::Deny => "--blacklist",
                    };
                    args.push(format!("{flag}={}", rule.path.display()));
                }
                Directive::CapsDrop { .. } => args.push("--caps.drop=all".into()),
                Directive::NoRoot => args.push("--noroot".into()),
                Directive::NoNewPrivileges => args.push("--nonewprivs".into()),
                Directive::RestrictNamespaces => args.push("--restrict-namespaces".into()),
                Directive::Protocols { allow } => {
                    let names: Vec<&str> = allow.iter().map(|p| p.as_str()).collect();
                    args.push(format!("--protocol={}", names.join(",")));
                }
                Directive::Interpreters { allow } => {
                    let names: Vec<String> = allow
                        .iter()
                        .filter_map(|p| p.file_name())
                        .map(|n| n.to_string_lossy().into_owned())
                        .collect();
                    args.push(format!("--private-bin={}", names.join(",")));
                }
            }
        }
        args.push("--seccomp".into());
        args
    }

    // setuid root; no-new-privs on the helper would strip it.
    fn privileged_helper(&self) -> bool {
        true
    }
}

/// Launches commands through a [`SandboxBackend`].
pub struct Sandbox {
    backend: Box<dyn SandboxBackend>,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(Box::new(Firejail::new()))
    }
}

impl Sandbox {
    pub fn new(backend: Box<dyn SandboxBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Fail early when the enforcement layer is missing.
    pub fn ensure_available(&self) -> Result<PathBuf> {
        self.backend.locate()
    }

    /// Build the confined command without spawning it.
    pub fn command(&self, policy: &SandboxPolicy, cmd: &SandboxCommand) -> Result<Command> {
        if !policy.is_interpreter_allowed(&cmd.program) {
            return Err(KernelError::Config(format!(
                "{} is not an allow-listed interpreter",
                cmd.program.display()
            )));
        }
        let helper = self.backend.locate()?;

        let mut command = Command::new(helper);
        command
            .args(self.backend.arguments(policy))
            .arg("--")
            .arg(&cmd.program)
            .args(&cmd.args)
            .current_dir(&cmd.cwd)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &policy.base.home)
            .env(
                "LANG",
                std::env::var("LANG").unwrap_or_else(|_| "C.UTF-8".to_string()),
            )
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        if cmd.capture_output {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        if !self.backend.privileged_helper() {
            set_no_new_privs_on_exec(&mut command);
        }
        Ok(command)
    }

    /// Spawn `cmd` confined by `policy`.
    pub fn apply(&self, policy: &SandboxPolicy, cmd: &SandboxCommand) -> Result<Child> {
        let mut command = self.command(policy, cmd)?;
        log::debug!(
            "sandbox[{}]: launching {} in {}",
            self.backend.name(),
            cmd.program.display(),
            cmd.cwd.display()
        );
        command.spawn().map_err(|e| {
            KernelError::SandboxUnavailable(format!(
                "failed to start {} helper: {e}",
                self.backend.name()
            ))
        })
    }
}

/// Launch `cmd` under `policy` with the default firejail backend.
pub fn apply(policy: &SandboxPolicy, cmd: &SandboxCommand) -> Result<Child> {
    Sandbox::default().apply(policy, cmd)
}

#[cfg(target_os = "linux")]
fn set_no_new_privs_on_exec(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: prctl is async-signal-safe and touches no parent state.
    unsafe {
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn set_no_new_privs_on_exec(_command: &mut Command) {}

/// Resolve `program` against the interpreter allow-list by file name.
pub fn allowed_interpreter(policy: &SandboxPolicy, program: &str) -> Option<PathBuf> {
    let wanted = Path::new(program);
    if wanted.is_absolute() {
        return policy.is_interpreter_allowed(wanted).then(|| wanted.to_path_buf());
    }
    policy
        .interpreters
        .iter()
        .find(|p| p.file_name() == Some(wanted.as_os_str()))
        .cloned()
}
