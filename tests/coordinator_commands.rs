//! Operator command surface: authorization, restart hand-off and the
//! read-only diagnostics.

mod support;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use module_kernel::coordinator::{CoordinatorSettings, KernelInfo};
use module_kernel::installer::{CancelToken, FetchContext, InstallerSettings, SourceFetcher};
use module_kernel::sandbox::PolicySettings;
use module_kernel::signal::SendOutcome;
use module_kernel::{
    render_policy, BasePaths, Caller, CommandOutcome, KernelError, LifecycleCoordinator,
    ModuleInstaller, OperatorCommand, RestartMailbox,
};
use support::{module_files, Fixture};

const MOD_URL: &str = "https://example.com/mod.git";
const KERNEL_URL: &str = "https://example.com/kernel.git";

struct Harness {
    fx: Fixture,
    coordinator: Arc<LifecycleCoordinator>,
    signal_dir: PathBuf,
}

/// A coordinator over `fx`'s directories and registry. Two of these share
/// on-disk state but nothing in memory, like two operator processes.
fn coordinator_for(fx: &Fixture) -> LifecycleCoordinator {
    let work_dir = fx.dir.path().to_path_buf();
    let base = BasePaths {
        home: work_dir.join("home"),
        module_root: fx.module_root(),
        work_dir: work_dir.clone(),
    };
    let policy = render_policy(&base, &PolicySettings::default()).unwrap();
    let installer = ModuleInstaller::new(
        fx.registry.clone(),
        Box::new(fx.fetcher.clone()),
        InstallerSettings::new(fx.module_root()),
    );
    let settings = CoordinatorSettings {
        work_dir: work_dir.clone(),
        branch: "master".to_string(),
        fetch_timeout: Duration::from_secs(5),
        policy: policy.document(),
        secrets_file: ".env".to_string(),
        download_dir: work_dir.join("downloads-out"),
    };
    LifecycleCoordinator::new(
        installer,
        RestartMailbox::new(work_dir.join(".restart")),
        settings,
    )
}

fn harness() -> Harness {
    let fx = Fixture::new();
    let coordinator = Arc::new(coordinator_for(&fx));
    let signal_dir = fx.dir.path().join(".restart");
    Harness {
        fx,
        coordinator,
        signal_dir,
    }
}

fn admin() -> Caller {
    Caller::admin("op")
}

#[test]
fn unauthorized_unload_has_no_side_effect() {
    let h = harness();
    h.fx.fetcher.publish(MOD_URL, "rev1", module_files("1"));
    let loaded = h
        .coordinator
        .execute(&admin(), OperatorCommand::ModuleLoad { url: MOD_URL.into() })
        .unwrap();
    let CommandOutcome::RestartPending { module: Some(record), .. } = loaded else {
        panic!("unexpected outcome {loaded:?}");
    };
    // Consume the load's restart request.
    h.coordinator.mailbox().receive().unwrap();

    let err = h
        .coordinator
        .execute(
            &Caller::anonymous("stranger"),
            OperatorCommand::ModuleUnload { name: "mod".into() },
        )
        .unwrap_err();
    assert!(matches!(err, KernelError::PermissionDenied(_)), "{err}");
    assert_eq!(err.kind(), "permission_denied");

    assert_eq!(h.fx.registry.get("mod").unwrap().unwrap(), record);
    assert!(record.install_path.join("main.py").is_file());
    assert!(h.coordinator.mailbox().pending().unwrap().is_none());
}

#[test]
fn every_mutating_verb_requires_admin() {
    let h = harness();
    let anon = Caller::anonymous("stranger");
    for command in [
        OperatorCommand::ModuleLoad { url: MOD_URL.into() },
        OperatorCommand::ModuleUpdate { name: "mod".into() },
        OperatorCommand::KernelUpdate,
        OperatorCommand::DebugReboot,
    ] {
        let err = h.coordinator.execute(&anon, command.clone()).unwrap_err();
        assert!(matches!(err, KernelError::PermissionDenied(_)), "{command:?}");
    }
    assert_eq!(h.fx.fetcher.clones(), 0);
    assert!(!h.signal_dir.join("restart.request").exists());
}

#[test]
fn mutations_coalesce_into_one_pending_restart() {
    let h = harness();
    h.fx.fetcher.publish(MOD_URL, "rev1", module_files("1"));
    h.fx
        .fetcher
        .publish("https://example.com/other.git", "o1", module_files("o"));

    let first = h
        .coordinator
        .execute(&admin(), OperatorCommand::ModuleLoad { url: MOD_URL.into() })
        .unwrap();
    assert!(matches!(
        first,
        CommandOutcome::RestartPending {
            restart: SendOutcome::Queued,
            ..
        }
    ));
    let second = h
        .coordinator
        .execute(
            &admin(),
            OperatorCommand::ModuleLoad {
                url: "https://example.com/other.git".into(),
            },
        )
        .unwrap();
    assert!(matches!(
        second,
        CommandOutcome::RestartPending {
            restart: SendOutcome::Coalesced,
            ..
        }
    ));

    let request = h.coordinator.mailbox().receive().unwrap().unwrap();
    assert_eq!(request.reason, "module load");
    assert_eq!(request.requested_by, "op");
    assert!(h.coordinator.mailbox().receive().unwrap().is_none());
}

#[test]
fn read_only_verbs_need_no_role() {
    let h = harness();
    h.fx.fetcher.publish(MOD_URL, "rev1", module_files("1"));
    h.coordinator
        .execute(&admin(), OperatorCommand::ModuleLoad { url: MOD_URL.into() })
        .unwrap();

    let anon = Caller::anonymous("viewer");
    match h.coordinator.execute(&anon, OperatorCommand::ModuleList).unwrap() {
        CommandOutcome::ModuleList { modules } => {
            assert_eq!(modules.len(), 1);
            assert_eq!(modules[0].name, "mod");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    match h
        .coordinator
        .execute(&anon, OperatorCommand::ModuleInfo { name: "mod".into() })
        .unwrap()
    {
        CommandOutcome::ModuleInfo(info) => assert_eq!(info.changelog, "1: initial\n"),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn unload_supersedes_in_flight_install() {
    let h = harness();
    h.fx.fetcher.publish(MOD_URL, "rev1", module_files("1"));
    h.fx.fetcher.hold();

    let coordinator = Arc::clone(&h.coordinator);
    let load = std::thread::spawn(move || {
        coordinator.execute(&admin(), OperatorCommand::ModuleLoad { url: MOD_URL.into() })
    });
    h.fx.fetcher.wait_entered(1);

    let outcome = h
        .coordinator
        .execute(&admin(), OperatorCommand::ModuleUnload { name: "mod".into() })
        .unwrap();
    assert!(
        matches!(outcome, CommandOutcome::InstallCancelled { ref name } if name == "mod"),
        "{outcome:?}"
    );
    let err = load.join().unwrap().unwrap_err();
    assert!(matches!(err, KernelError::Cancelled(_)), "{err}");

    assert!(h.fx.registry.get("mod").unwrap().is_none());
    assert!(!h.fx.module_root().join("mod").exists());
    assert!(!h.fx.staging_dir("mod").exists());
    assert!(h.coordinator.mailbox().pending().unwrap().is_none());
}

#[test]
fn kernel_update_fast_forwards_work_tree() {
    let h = harness();
    h.fx.fetcher.publish(KERNEL_URL, "k1", module_files("k1"));
    let ctx = FetchContext::new(Duration::from_secs(5), CancelToken::new());
    h.fx
        .fetcher
        .clone_shallow(KERNEL_URL, "master", h.fx.dir.path(), &ctx)
        .unwrap();
    h.fx.fetcher.publish(KERNEL_URL, "k2", module_files("k2"));

    let outcome = h
        .coordinator
        .execute(&admin(), OperatorCommand::KernelUpdate)
        .unwrap();
    match outcome {
        CommandOutcome::RestartPending { revision, .. } => {
            assert_eq!(revision.as_deref(), Some("k2"))
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let info = match h
        .coordinator
        .execute(&Caller::anonymous("viewer"), OperatorCommand::KernelInfo)
        .unwrap()
    {
        CommandOutcome::KernelInfo(info) => info,
        other => panic!("unexpected outcome {other:?}"),
    };
    let KernelInfo {
        repo, supervisor, ..
    } = info;
    assert_eq!(repo.unwrap().head, "k2");
    assert!(supervisor.is_none());
}

#[test]
fn debug_export_and_download_are_read_only() {
    let h = harness();
    h.fx.fetcher.publish(MOD_URL, "rev1", module_files("1"));
    h.coordinator
        .execute(&admin(), OperatorCommand::ModuleLoad { url: MOD_URL.into() })
        .unwrap();
    std::fs::write(h.fx.dir.path().join(".env"), "BOT_TOKEN=secret").unwrap();
    h.coordinator.mailbox().receive().unwrap();

    let anon = Caller::anonymous("viewer");
    let export = match h.coordinator.execute(&anon, OperatorCommand::DebugExport).unwrap() {
        CommandOutcome::Export(value) => value,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert_eq!(export["modules"][0]["name"], "mod");
    assert_eq!(export["policy"]["version"], 1);
    assert!(!export.to_string().contains("BOT_TOKEN"));

    let summary = match h.coordinator.execute(&anon, OperatorCommand::DebugDownload).unwrap() {
        CommandOutcome::Archive(summary) => summary,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert!(summary.path.is_file());
    assert!(summary.files >= 3);
    assert!(h.coordinator.mailbox().pending().unwrap().is_none());
}

#[test]
fn denied_or_malformed_commands_create_nothing() {
    let h = harness();
    let err = h
        .coordinator
        .execute_exclusive(
            &Caller::anonymous("stranger"),
            OperatorCommand::ModuleUnload { name: "mod".into() },
        )
        .unwrap_err();
    assert!(matches!(err, KernelError::PermissionDenied(_)), "{err}");

    let err = h
        .coordinator
        .execute_exclusive(&admin(), OperatorCommand::ModuleUnload { name: "../mod".into() })
        .unwrap_err();
    assert!(matches!(err, KernelError::InvalidName(_)), "{err}");

    assert!(!h.signal_dir.exists());
    assert!(!h.fx.module_root().exists());
}

#[test]
fn unload_from_another_operator_cancels_install() {
    let h = harness();
    h.fx.fetcher.publish(MOD_URL, "rev1", module_files("1"));
    h.fx.fetcher.hold();
    let other = coordinator_for(&h.fx);

    let coordinator = Arc::clone(&h.coordinator);
    let load = std::thread::spawn(move || {
        coordinator.execute_exclusive(&admin(), OperatorCommand::ModuleLoad { url: MOD_URL.into() })
    });
    h.fx.fetcher.wait_entered(1);

    let outcome = other
        .execute_exclusive(&admin(), OperatorCommand::ModuleUnload { name: "mod".into() })
        .unwrap();
    assert!(
        matches!(outcome, CommandOutcome::InstallCancelled { ref name } if name == "mod"),
        "{outcome:?}"
    );
    let err = load.join().unwrap().unwrap_err();
    assert!(matches!(err, KernelError::Cancelled(_)), "{err}");

    assert!(h.fx.registry.get("mod").unwrap().is_none());
    assert!(!h.fx.module_root().join("mod").exists());
    assert!(!h.fx.staging_dir("mod").exists());
    assert!(!h.signal_dir.join("cancel").join("mod.cancel").exists());
}

#[test]
fn operators_on_distinct_modules_do_not_block() {
    let h = harness();
    let other_url = "https://example.com/other.git";
    h.fx.fetcher.publish(MOD_URL, "rev1", module_files("1"));
    h.fx.fetcher.publish(other_url, "o1", module_files("o"));
    h.fx.fetcher.hold_url(MOD_URL);
    let other = coordinator_for(&h.fx);

    let coordinator = Arc::clone(&h.coordinator);
    let load = std::thread::spawn(move || {
        coordinator.execute_exclusive(&admin(), OperatorCommand::ModuleLoad { url: MOD_URL.into() })
    });
    h.fx.fetcher.wait_entered(1);

    let loaded = other
        .execute_exclusive(&admin(), OperatorCommand::ModuleLoad { url: other_url.into() })
        .unwrap();
    assert!(matches!(loaded, CommandOutcome::RestartPending { .. }), "{loaded:?}");

    let err = other
        .execute_exclusive(&admin(), OperatorCommand::ModuleUpdate { name: "mod".into() })
        .unwrap_err();
    assert!(matches!(err, KernelError::AlreadyInProgress(ref name) if name == "mod"), "{err}");

    h.fx.fetcher.release();
    load.join().unwrap().unwrap();
    assert_eq!(h.fx.registry.list().unwrap().len(), 2);
}
