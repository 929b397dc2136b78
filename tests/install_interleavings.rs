//! Randomized interleavings of install/update/remove across two threads.
//!
//! Whatever the schedule, every name ends either fully installed (record and
//! valid tree) or absent (no record, no directory), and nothing is left in
//! staging.

mod support;

use proptest::prelude::*;
use std::sync::{Arc, Barrier};

use module_kernel::{CancelToken, KernelError, ModuleStatus};
use support::{module_files, Fixture};

const NAMES: [&str; 2] = ["alpha", "beta"];

#[derive(Clone, Copy, Debug)]
enum Op {
    Install(usize),
    Update(usize),
    Remove(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..NAMES.len()).prop_map(Op::Install),
        (0..NAMES.len()).prop_map(Op::Update),
        (0..NAMES.len()).prop_map(Op::Remove),
    ]
}

fn url(idx: usize) -> String {
    format!("https://example.com/{}.git", NAMES[idx])
}

fn run(fx: &Fixture, op: Op) {
    let cancel = CancelToken::new();
    let result = match op {
        Op::Install(i) => fx.installer.install(&url(i), &cancel).map(|_| ()),
        Op::Update(i) => fx.installer.update(NAMES[i], &cancel).map(|_| ()),
        Op::Remove(i) => fx.installer.remove(NAMES[i]),
    };
    match result {
        Ok(()) | Err(KernelError::AlreadyInProgress(_)) | Err(KernelError::NotFound(_)) => {}
        Err(other) => panic!("{op:?} failed unexpectedly: {other}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn per_name_operations_linearize(
        left in proptest::collection::vec(op(), 1..8),
        right in proptest::collection::vec(op(), 1..8),
    ) {
        let fx = Arc::new(Fixture::new());
        for i in 0..NAMES.len() {
            fx.fetcher.publish(&url(i), "r1", module_files("1"));
        }

        let start = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [left, right]
            .into_iter()
            .map(|ops| {
                let fx = Arc::clone(&fx);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    for op in ops {
                        run(&fx, op);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for name in NAMES {
            let dir = fx.module_root().join(name);
            match fx.registry.get(name).unwrap() {
                Some(record) => {
                    prop_assert_eq!(record.status, ModuleStatus::Installed);
                    prop_assert!(dir.join("main.py").is_file());
                    prop_assert!(dir.join("requirements.txt").is_file());
                }
                None => prop_assert!(!dir.exists(), "{} left without a record", name),
            }
        }
        let staging = fx.module_root().join(".partial");
        let leftovers = std::fs::read_dir(&staging)
            .map(|entries| entries.count())
            .unwrap_or(0);
        prop_assert_eq!(leftovers, 0);
    }
}
