//! Sandbox boundary for the supervised process and module installs.
//!
//! Module code is never loaded in-process. It runs in a separate process
//! confined by a capability policy: the module root is mounted noexec,
//! all capabilities are dropped, privilege escalation is disabled, only the
//! declared protocol families are reachable and only allow-listed
//! interpreters may run.

pub mod launch;
pub mod policy;

pub use launch::{allowed_interpreter, apply, Firejail, Sandbox, SandboxBackend, SandboxCommand};
pub use policy::{
    render_policy, BasePaths, CapabilityDrop, Directive, FsAccess, FsRule, NetworkProtocol,
    PolicyDocument, PolicySettings, SandboxPolicy, POLICY_VERSION,
};
