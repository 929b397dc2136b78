//! The supervised process handle and the launcher that creates it.

use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::launch::Secrets;
use crate::sandbox::{Sandbox, SandboxCommand, SandboxPolicy};
use crate::{KernelError, Result};

/// How the supervised process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code a launcher script should propagate.
    pub fn as_exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

pub trait SupervisedProcess: Send {
    fn pid(&self) -> u32;

    /// Non-blocking exit check.
    fn try_exit(&mut self) -> Result<Option<ExitInfo>>;

    /// Whether the process has signalled readiness.
    fn is_ready(&self) -> bool;

    /// Ask the process to stop (SIGTERM).
    fn terminate(&mut self) -> Result<()>;

    /// Force the process to stop (SIGKILL).
    fn kill(&mut self) -> Result<()>;

    /// Block until the process has exited and reap it.
    fn wait(&mut self) -> Result<ExitInfo>;
}

pub trait ProcessLauncher: Send {
    fn launch(&mut self) -> Result<Box<dyn SupervisedProcess>>;
}

/// Launches the bot command inside the sandbox.
pub struct SandboxedLauncher {
    sandbox: Sandbox,
    policy: SandboxPolicy,
    command: SandboxCommand,
    secrets: Secrets,
    ready_line: Option<String>,
}

impl SandboxedLauncher {
    pub fn new(
        sandbox: Sandbox,
        policy: SandboxPolicy,
        command: SandboxCommand,
        secrets: Secrets,
        ready_line: Option<String>,
    ) -> Self {
        Self {
            sandbox,
            policy,
            command,
            secrets,
            ready_line,
        }
    }
}

impl ProcessLauncher for SandboxedLauncher {
    fn launch(&mut self) -> Result<Box<dyn SupervisedProcess>> {
        let mut command = self.command.clone();
        command.capture_output = true;
        for (key, value) in self.secrets.iter() {
            command.env.push((key.to_string(), value.to_string()));
        }
        let mut child = self.sandbox.apply(&self.policy, &command)?;

        let ready = Arc::new(AtomicBool::new(self.ready_line.is_none()));
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, "stdout", self.ready_line.clone(), ready.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, "stderr", self.ready_line.clone(), ready.clone());
        }
        log::info!("launched supervised process pid={}", child.id());
        Ok(Box::new(ChildProcess { child, ready }))
    }
}

fn forward_lines<R: Read + Send + 'static>(
    pipe: R,
    stream: &'static str,
    ready_line: Option<String>,
    ready: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        for line in BufReader::new(pipe).lines() {
            let Ok(line) = line else { break };
            log::info!(target: "kernel::child", "[{stream}] {line}");
            if let Some(marker) = &ready_line {
                if line.contains(marker.as_str()) && !ready.swap(true, Ordering::SeqCst) {
                    log::info!("supervised process reported ready");
                }
            }
        }
    });
}

struct ChildProcess {
    child: Child,
    ready: Arc<AtomicBool>,
}

impl SupervisedProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_exit(&mut self) -> Result<Option<ExitInfo>> {
        Ok(self.child.try_wait()?.map(ExitInfo::from))
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        let pid = libc::pid_t::try_from(self.child.id())
            .map_err(|_| KernelError::Storage(anyhow::anyhow!("pid out of range")))?;
        // SAFETY: plain syscall on a pid we own and have not reaped yet.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err.into());
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        self.kill()
    }

    fn wait(&mut self) -> Result<ExitInfo> {
        Ok(self.child.wait()?.into())
    }

    fn kill(&mut self) -> Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
