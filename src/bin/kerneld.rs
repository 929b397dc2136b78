//! kerneld - module kernel supervisor daemon
//!
//! This daemon:
//! 1. Loads config and copies the secrets file into the working tree
//! 2. Renders the sandbox policy and refuses to start without the sandbox helper
//! 3. Repairs installer state left behind by a crash
//! 4. Supervises the sandboxed bot process until Ctrl-C or crash-loop exhaustion
//!
//! The exit code is the supervised process's last exit code.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use module_kernel::coordinator::OperatorLock;
use module_kernel::launch::{build_launcher, prepare_launch, Secrets};
use module_kernel::{
    GitCli, KernelConfig, KernelError, LifecycleCoordinator, RestartMailbox, Sandbox,
    Supervisor,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = KernelConfig::load()?;
    log::info!(
        "kerneld {} starting in {}",
        env!("CARGO_PKG_VERSION"),
        cfg.work_dir.display()
    );

    if let Some(config_dir) = &cfg.config_dir {
        prepare_launch(config_dir, &cfg.work_dir, &cfg.secrets_file)?;
    }
    let secrets_path = cfg.secrets_path();
    let secrets = if secrets_path.exists() {
        Secrets::load(&secrets_path)?
    } else {
        log::warn!("no secrets file at {}", secrets_path.display());
        Secrets::default()
    };
    log::info!("loaded {} secret(s)", secrets.len());

    let policy = cfg.render_policy()?;
    let sandbox = Sandbox::default();
    let helper = sandbox.ensure_available()?;
    log::info!(
        "sandbox {} at {} (policy v{})",
        sandbox.backend_name(),
        helper.display(),
        policy.document().version
    );
    log::debug!("{}", policy.document());

    std::fs::create_dir_all(&cfg.module_root)?;
    std::fs::create_dir_all(&cfg.signal_dir)?;
    {
        let coordinator = LifecycleCoordinator::from_config(&cfg, Box::new(GitCli::new()))?;
        match OperatorLock::try_exclusive(&cfg.signal_dir) {
            Ok(_lock) => {
                let report = coordinator.installer().recover()?;
                log::debug!("recovery report: {:?}", report);
            }
            Err(KernelError::AlreadyInProgress(_)) => {
                log::warn!("operator command in progress; leaving recovery to the next operator")
            }
            Err(e) => return Err(e.into()),
        }
        log::info!(
            "{} module(s) available to the supervised process",
            coordinator.installer().registry().installed()?.len()
        );
    }

    let launcher = build_launcher(&cfg, sandbox, policy, secrets)?;
    let mut supervisor = Supervisor::new(
        Box::new(launcher),
        RestartMailbox::new(&cfg.signal_dir),
        cfg.supervisor_settings(),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {e}"))?;

    log::info!("kerneld supervising {:?}", cfg.launch.command);
    match supervisor.run(&shutdown) {
        Ok(Some(exit)) => {
            log::info!("kerneld stopped; last exit {:?}", exit);
            std::process::exit(exit.as_exit_code());
        }
        Ok(None) => Ok(()),
        Err(err) => {
            log::error!("kerneld giving up: {}", err);
            if let Some(exit) = supervisor.last_exit() {
                std::process::exit(exit.as_exit_code().max(1));
            }
            Err(err.into())
        }
    }
}
