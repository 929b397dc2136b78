//! Module Kernel
//!
//! Lifecycle manager for untrusted, dynamically fetched code modules that run
//! inside a restrictive execution sandbox.
//!
//! # Architecture
//!
//! The kernel holds these invariants by construction:
//!
//! 1. **No In-Process Loading**: module code only ever runs in a separate,
//!    sandboxed process through an allow-listed interpreter.
//! 2. **Noexec Module Root**: files written under the module root can never
//!    become new binaries.
//! 3. **All-or-Nothing Installs**: a module record becomes `Installed` only after
//!    its working tree validates; failures leave no record and no directory.
//! 4. **Non-Destructive Updates**: updates are fast-forward only; local drift
//!    is reported, never reset.
//! 5. **Bounded Recovery**: every retry path (restarts, fetches) has a bound.
//! 6. **Single-Slot Restart Mailbox**: the coordinator and the supervisor only
//!    talk through the durable restart marker and the module registry.
//!
//! # Module Structure
//!
//! - `sandbox`: capability policy rendering and sandboxed launch
//! - `registry`: durable module records
//! - `installer`: fetch, validate, update and remove modules
//! - `signal`: restart marker mailbox
//! - `supervisor`: crash-aware process supervision
//! - `coordinator`: operator command surface
//! - `config`, `launch`, `archive`: ambient plumbing

use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod archive;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod installer;
pub mod launch;
pub mod registry;
pub mod sandbox;
pub mod signal;
pub mod supervisor;

pub use config::KernelConfig;
pub use coordinator::{
    Authorizer, Caller, CommandOutcome, LifecycleCoordinator, OperatorCommand, TokenAuthorizer,
    ADMIN_ROLE,
};
pub use error::{KernelError, Result};
pub use installer::{CancelToken, GitCli, ModuleInstaller, ModuleSource, SourceFetcher};
pub use registry::{ModuleRecord, ModuleRegistry, ModuleStatus};
pub use sandbox::{render_policy, BasePaths, PolicyDocument, Sandbox, SandboxPolicy};
pub use signal::{RestartMailbox, RestartRequest};
pub use supervisor::{RestartPolicy, Supervisor, SupervisorState, SupervisorStatus};

/// Registry location for tests and throwaway kernels: a named in-memory
/// SQLite database that every connection opened with the same URI shares.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("file:modules-{}?mode=memory&cache=shared", hex::encode(bytes))
}

/// How long a registry write waits for another process (kerneld vs.
/// kernelctl) to release the database.
const REGISTRY_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the module registry at `location`, a file path or a `file:` URI.
///
/// File-backed registries use WAL with full sync so an acknowledged
/// mutation survives power loss and readers never see a torn write.
pub(crate) fn open_registry_connection(location: &str) -> Result<Connection> {
    let in_memory = location.starts_with("file:") && location.contains("mode=memory");
    let conn = if location.starts_with("file:") {
        Connection::open_with_flags(
            location,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?
    } else {
        Connection::open(location)?
    };
    conn.busy_timeout(REGISTRY_BUSY_TIMEOUT)?;
    if !in_memory {
        // journal_mode reports the resulting mode as a row.
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    }
    conn.execute_batch("PRAGMA synchronous=FULL;")?;
    Ok(conn)
}

pub(crate) fn now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
