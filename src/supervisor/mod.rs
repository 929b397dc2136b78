//! Process supervisor.
//!
//! Owns the single supervised process and drives it through
//! `Stopped -> Starting -> Running -> {Stopping, Crashed}`. The only inputs
//! from the rest of the kernel are the restart marker ([`RestartMailbox`])
//! and the registry the relaunched process reads at startup. The supervisor
//! publishes its status to `supervisor.json` next to the marker after every
//! transition.

pub mod policy;
pub mod process;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub use policy::{CrashDecision, CrashWindow, RestartPolicy};
pub use process::{ExitInfo, ProcessLauncher, SandboxedLauncher, SupervisedProcess};

use crate::signal::{write_atomic, RestartMailbox};
use crate::{now_s, KernelError, Result};

const STATUS_FILE: &str = "supervisor.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Snapshot published for `kernel info` and `debug export`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub crashes_in_window: usize,
    pub total_restarts: u64,
    pub last_exit: Option<ExitInfo>,
    pub fatal: Option<String>,
    /// seconds since epoch
    pub updated_at: u64,
}

impl SupervisorStatus {
    pub fn path(signal_dir: &Path) -> PathBuf {
        signal_dir.join(STATUS_FILE)
    }

    /// Last published status, if the supervisor has ever run.
    pub fn read(signal_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(signal_dir);
        match std::fs::read(&path) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub restart: RestartPolicy,
    /// How long a stopping process may drain before it is killed.
    pub grace_period: Duration,
    /// Minimum delay between two marker-triggered restarts.
    pub watch_delay: Duration,
    /// Launches that never report ready within this bound count as crashes.
    pub ready_timeout: Option<Duration>,
    pub poll_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            restart: RestartPolicy::default(),
            grace_period: Duration::from_secs(10),
            watch_delay: Duration::from_secs(3),
            ready_timeout: Some(Duration::from_secs(120)),
            poll_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AfterStop {
    Restart,
    Halt,
}

#[derive(Clone, Copy, Debug)]
struct StopPlan {
    deadline: Instant,
    then: AfterStop,
    forced: bool,
}

pub struct Supervisor {
    launcher: Box<dyn ProcessLauncher>,
    mailbox: RestartMailbox,
    settings: SupervisorSettings,
    state: SupervisorState,
    process: Option<Box<dyn SupervisedProcess>>,
    started_at: Option<Instant>,
    crashes: CrashWindow,
    restart_at: Option<Instant>,
    stop: Option<StopPlan>,
    last_watch_restart: Option<Instant>,
    last_exit: Option<ExitInfo>,
    fatal: Option<String>,
    total_restarts: u64,
}

impl Supervisor {
    pub fn new(
        launcher: Box<dyn ProcessLauncher>,
        mailbox: RestartMailbox,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            launcher,
            mailbox,
            settings,
            state: SupervisorState::Stopped,
            process: None,
            started_at: None,
            crashes: CrashWindow::default(),
            restart_at: None,
            stop: None,
            last_watch_restart: None,
            last_exit: None,
            fatal: None,
            total_restarts: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn last_exit(&self) -> Option<ExitInfo> {
        self.last_exit
    }

    pub fn fatal(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    pub fn status(&mut self) -> SupervisorStatus {
        SupervisorStatus {
            state: self.state,
            pid: self.process.as_ref().map(|p| p.pid()),
            crashes_in_window: self
                .crashes
                .in_window(&self.settings.restart, Instant::now()),
            total_restarts: self.total_restarts,
            last_exit: self.last_exit,
            fatal: self.fatal.clone(),
            updated_at: now_s(),
        }
    }

    fn set_state(&mut self, next: SupervisorState) {
        if self.state != next {
            log::info!("supervisor: {} -> {}", self.state, next);
            self.state = next;
        }
        self.publish();
    }

    fn publish(&mut self) {
        let status = self.status();
        let path = SupervisorStatus::path(self.mailbox.dir());
        let written = std::fs::create_dir_all(self.mailbox.dir())
            .map_err(KernelError::from)
            .and_then(|_| Ok(serde_json::to_vec_pretty(&status)?))
            .and_then(|bytes| write_atomic(&path, &bytes));
        if let Err(e) = written {
            log::warn!("supervisor: failed to publish status: {}", e);
        }
    }

    /// `Stopped -> Starting`. An explicit start re-arms a crash-looped supervisor.
    pub fn start(&mut self) {
        if self.state == SupervisorState::Stopped {
            self.fatal = None;
            self.crashes.clear();
            self.set_state(SupervisorState::Starting);
        }
    }

    /// Begin a graceful shutdown. The process ends in `Stopped`.
    pub fn request_shutdown(&mut self) {
        match self.state {
            SupervisorState::Running | SupervisorState::Starting => {
                self.begin_stop(Instant::now(), AfterStop::Halt)
            }
            SupervisorState::Stopping => {
                if let Some(stop) = self.stop.as_mut() {
                    stop.then = AfterStop::Halt;
                }
            }
            SupervisorState::Crashed => {
                self.restart_at = None;
                self.set_state(SupervisorState::Stopped);
            }
            SupervisorState::Stopped => {}
        }
    }

    /// Advance the state machine by one tick.
    ///
    /// Returns `CrashLoopExceeded` on the tick that exhausts the restart
    /// budget and `SandboxUnavailable` if the sandbox cannot be entered; in
    /// both cases the supervisor is left `Stopped`.
    pub fn step(&mut self) -> Result<SupervisorState> {
        let now = Instant::now();
        match self.state {
            SupervisorState::Stopped => {
                if let Some(request) = self.take_signal(now)? {
                    log::info!(
                        "supervisor: restart marker from {} ({}) while stopped",
                        request.requested_by,
                        request.reason
                    );
                    self.fatal = None;
                    self.crashes.clear();
                    self.set_state(SupervisorState::Starting);
                }
            }
            SupervisorState::Starting => self.step_starting(now)?,
            SupervisorState::Running => {
                if let Some(exit) = self.poll_exit()? {
                    self.on_exit(exit, now)?;
                } else if let Some(request) = self.take_signal(now)? {
                    log::info!(
                        "supervisor: restart requested by {} ({})",
                        request.requested_by,
                        request.reason
                    );
                    self.last_watch_restart = Some(now);
                    self.begin_stop(now, AfterStop::Restart);
                }
            }
            SupervisorState::Stopping => self.step_stopping(now)?,
            SupervisorState::Crashed => {
                if self.restart_at.is_some_and(|at| now >= at) {
                    self.restart_at = None;
                    self.set_state(SupervisorState::Starting);
                }
            }
        }
        Ok(self.state)
    }

    fn step_starting(&mut self, now: Instant) -> Result<()> {
        if self.process.is_none() {
            // The relaunch re-reads the registry, so it satisfies any pending request.
            if let Some(request) = self.mailbox.receive()? {
                log::debug!("supervisor: launch absorbs restart request ({})", request.reason);
            }
            match self.launcher.launch() {
                Ok(process) => {
                    self.process = Some(process);
                    self.started_at = Some(now);
                    self.publish();
                }
                Err(err @ KernelError::SandboxUnavailable(_)) => {
                    log::error!("supervisor: {}; refusing to run unsandboxed", err);
                    self.fatal = Some(err.to_string());
                    self.set_state(SupervisorState::Stopped);
                    return Err(err);
                }
                Err(err) => {
                    log::warn!("supervisor: launch failed: {}", err);
                    return self.on_crash(now);
                }
            }
        }

        if let Some(exit) = self.poll_exit()? {
            return self.on_exit(exit, now);
        }
        if self.process.as_ref().is_some_and(|p| p.is_ready()) {
            self.set_state(SupervisorState::Running);
            return Ok(());
        }
        let timed_out = match (self.settings.ready_timeout, self.started_at) {
            (Some(limit), Some(started)) => now.duration_since(started) >= limit,
            _ => false,
        };
        if timed_out {
            log::warn!("supervisor: process never reported ready, killing it");
            if let Some(mut process) = self.process.take() {
                process.kill()?;
                self.last_exit = Some(process.wait()?);
            }
            return self.on_crash(now);
        }
        Ok(())
    }

    fn step_stopping(&mut self, now: Instant) -> Result<()> {
        let Some(mut stop) = self.stop else {
            self.set_state(SupervisorState::Stopped);
            return Ok(());
        };
        if let Some(exit) = self.poll_exit()? {
            self.last_exit = Some(exit);
            self.process = None;
            self.stop = None;
            log::info!("supervisor: process stopped ({:?})", exit);
            let next = match stop.then {
                AfterStop::Restart => SupervisorState::Starting,
                AfterStop::Halt => SupervisorState::Stopped,
            };
            self.set_state(next);
            return Ok(());
        }
        if now >= stop.deadline && !stop.forced {
            log::warn!(
                "supervisor: grace period of {:?} elapsed, force-terminating",
                self.settings.grace_period
            );
            if let Some(process) = self.process.as_mut() {
                process.kill()?;
            }
            stop.forced = true;
            self.stop = Some(stop);
        }
        Ok(())
    }

    fn begin_stop(&mut self, now: Instant, then: AfterStop) {
        let Some(process) = self.process.as_mut() else {
            let next = match then {
                AfterStop::Restart => SupervisorState::Starting,
                AfterStop::Halt => SupervisorState::Stopped,
            };
            self.set_state(next);
            return;
        };
        if let Err(e) = process.terminate() {
            log::warn!("supervisor: terminate failed: {}", e);
        }
        self.stop = Some(StopPlan {
            deadline: now + self.settings.grace_period,
            then,
            forced: false,
        });
        self.set_state(SupervisorState::Stopping);
    }

    fn poll_exit(&mut self) -> Result<Option<ExitInfo>> {
        match self.process.as_mut() {
            Some(process) => process.try_exit(),
            None => Ok(None),
        }
    }

    fn take_signal(&mut self, now: Instant) -> Result<Option<crate::signal::RestartRequest>> {
        if let Some(last) = self.last_watch_restart {
            if now.duration_since(last) < self.settings.watch_delay {
                return Ok(None);
            }
        }
        self.mailbox.receive()
    }

    fn on_exit(&mut self, exit: ExitInfo, now: Instant) -> Result<()> {
        self.process = None;
        self.last_exit = Some(exit);
        if exit.success() {
            log::info!("supervisor: process exited cleanly");
            self.set_state(SupervisorState::Stopped);
            return Ok(());
        }
        log::warn!(
            "supervisor: process crashed (code={:?}, signal={:?})",
            exit.code,
            exit.signal
        );
        self.on_crash(now)
    }

    fn on_crash(&mut self, now: Instant) -> Result<()> {
        self.process = None;
        match self.crashes.record(&self.settings.restart, now) {
            CrashDecision::RestartAfter(delay) => {
                self.total_restarts += 1;
                self.restart_at = Some(now + delay);
                log::warn!("supervisor: restarting in {:?}", delay);
                self.set_state(SupervisorState::Crashed);
                Ok(())
            }
            CrashDecision::GiveUp { crashes } => {
                let err = KernelError::CrashLoopExceeded {
                    crashes,
                    limit: self.settings.restart.max_restarts,
                    window_secs: self.settings.restart.window.as_secs(),
                };
                log::error!("supervisor: {}; operator intervention required", err);
                self.fatal = Some(err.to_string());
                self.restart_at = None;
                self.set_state(SupervisorState::Stopped);
                Err(err)
            }
        }
    }

    /// Run until `shutdown` is raised or a fatal error occurs.
    ///
    /// Returns the last exit of the supervised process so launchers can
    /// propagate it as their own exit code.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<Option<ExitInfo>> {
        self.start();
        let mut shutting_down = false;
        loop {
            if shutdown.load(Ordering::SeqCst) && !shutting_down {
                log::info!("supervisor: shutdown requested");
                shutting_down = true;
                self.request_shutdown();
            }
            let state = self.step()?;
            if shutting_down && state == SupervisorState::Stopped {
                return Ok(self.last_exit);
            }
            std::thread::sleep(self.settings.poll_interval);
        }
    }
}
