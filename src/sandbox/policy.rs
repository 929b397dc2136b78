//! Declarative capability policy for the supervised process.
//!
//! A [`SandboxPolicy`] is rendered once per launch from a handful of absolute
//! path roots and is never mutated afterwards; changing it requires a full
//! relaunch. The policy describes *what* is enforced. Turning it into a
//! running, confined process is the job of [`super::launch`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::{KernelError, Result};

/// Bumped whenever the meaning of a directive changes.
pub const POLICY_VERSION: u32 = 1;

/// Credential directories under home that the sandboxed process never sees.
const DENIED_HOME_ENTRIES: &[&str] = &[".ssh", ".gnupg", ".aws", ".netrc", ".docker"];

/// Filesystem access tag, ordered from least to most restrictive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FsAccess {
    ReadWrite,
    ReadOnly,
    NoExec,
    Deny,
}

impl fmt::Display for FsAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsAccess::ReadWrite => "read-write",
            FsAccess::ReadOnly => "read-only",
            FsAccess::NoExec => "noexec",
            FsAccess::Deny => "deny",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsRule {
    pub access: FsAccess,
    pub path: PathBuf,
}

impl FsRule {
    fn new(access: FsAccess, path: impl Into<PathBuf>) -> Self {
        Self {
            access,
            path: path.into(),
        }
    }

    fn matches(&self, path: &Path) -> bool {
        path.starts_with(&self.path)
    }
}

/// Socket protocol families the process may open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProtocol {
    Unix,
    Inet,
    Inet6,
    Netlink,
    Packet,
}

impl NetworkProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkProtocol::Unix => "unix",
            NetworkProtocol::Inet => "inet",
            NetworkProtocol::Inet6 => "inet6",
            NetworkProtocol::Netlink => "netlink",
            NetworkProtocol::Packet => "packet",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "unix" => Ok(NetworkProtocol::Unix),
            "inet" => Ok(NetworkProtocol::Inet),
            "inet6" => Ok(NetworkProtocol::Inet6),
            "netlink" => Ok(NetworkProtocol::Netlink),
            "packet" => Ok(NetworkProtocol::Packet),
            other => Err(KernelError::Config(format!(
                "unknown network protocol family '{other}'"
            ))),
        }
    }
}

/// Path roots the policy is rendered from. All must be absolute.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasePaths {
    pub home: PathBuf,
    pub module_root: PathBuf,
    pub work_dir: PathBuf,
}

/// Non-path inputs to rendering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySettings {
    pub interpreters: Vec<PathBuf>,
    pub protocols: Vec<NetworkProtocol>,
    /// Extra read-write carve-outs (logs, caches) on top of the working tree.
    pub extra_read_write: Vec<PathBuf>,
    /// Files inside the working tree that the process must not read directly.
    pub denied_files: Vec<PathBuf>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            interpreters: vec![PathBuf::from("/usr/bin/python3")],
            protocols: vec![
                NetworkProtocol::Unix,
                NetworkProtocol::Inet,
                NetworkProtocol::Inet6,
            ],
            extra_read_write: Vec::new(),
            denied_files: Vec::new(),
        }
    }
}

/// Linux capabilities are always dropped wholesale; there is no partial set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityDrop {
    All,
}

/// One line of the rendered policy document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "directive", rename_all = "kebab-case")]
pub enum Directive {
    Filesystem(FsRule),
    CapsDrop { caps: CapabilityDrop },
    NoRoot,
    NoNewPrivileges,
    RestrictNamespaces,
    Protocols { allow: Vec<NetworkProtocol> },
    Interpreters { allow: Vec<PathBuf> },
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Filesystem(rule) => write!(f, "{} {}", rule.access, rule.path.display()),
            Directive::CapsDrop { .. } => f.write_str("caps.drop all"),
            Directive::NoRoot => f.write_str("noroot"),
            Directive::NoNewPrivileges => f.write_str("nonewprivs"),
            Directive::RestrictNamespaces => f.write_str("restrict-namespaces"),
            Directive::Protocols { allow } => {
                let names: Vec<&str> = allow.iter().map(|p| p.as_str()).collect();
                write!(f, "protocol {}", names.join(","))
            }
            Directive::Interpreters { allow } => {
                let names: Vec<String> = allow.iter().map(|p| p.display().to_string()).collect();
                write!(f, "interpreters {}", names.join(","))
            }
        }
    }
}

/// Ordered, versioned list of directives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub version: u32,
    pub directives: Vec<Directive>,
}

impl fmt::Display for PolicyDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# module-kernel sandbox policy v{}", self.version)?;
        for directive in &self.directives {
            writeln!(f, "{directive}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub base: BasePaths,
    pub fs_rules: Vec<FsRule>,
    pub caps_drop: CapabilityDrop,
    pub no_new_privileges: bool,
    pub no_root: bool,
    pub restrict_namespaces: bool,
    pub protocols: BTreeSet<NetworkProtocol>,
    pub interpreters: Vec<PathBuf>,
}

/// Render the policy for a launch. Pure; touches nothing on disk.
pub fn render_policy(base: &BasePaths, settings: &PolicySettings) -> Result<SandboxPolicy> {
    require_absolute("home", &base.home)?;
    require_absolute("module root", &base.module_root)?;
    require_absolute("working directory", &base.work_dir)?;
    for extra in &settings.extra_read_write {
        require_absolute("read-write path", extra)?;
    }
    if settings.interpreters.is_empty() {
        return Err(KernelError::Config(
            "at least one interpreter must be allow-listed".into(),
        ));
    }
    for interpreter in &settings.interpreters {
        require_absolute("interpreter", interpreter)?;
    }
    if settings.protocols.is_empty() {
        return Err(KernelError::Config(
            "at least one network protocol family must be allowed".into(),
        ));
    }

    let mut fs_rules = vec![
        FsRule::new(FsAccess::ReadOnly, &base.home),
        FsRule::new(FsAccess::ReadWrite, &base.work_dir),
    ];
    for extra in &settings.extra_read_write {
        fs_rules.push(FsRule::new(FsAccess::ReadWrite, extra));
    }
    fs_rules.push(FsRule::new(FsAccess::NoExec, &base.module_root));
    for entry in DENIED_HOME_ENTRIES {
        fs_rules.push(FsRule::new(FsAccess::Deny, base.home.join(entry)));
    }
    for denied in &settings.denied_files {
        let path = if denied.is_absolute() {
            denied.clone()
        } else {
            base.work_dir.join(denied)
        };
        fs_rules.push(FsRule::new(FsAccess::Deny, path));
    }

    let policy = SandboxPolicy {
        base: base.clone(),
        fs_rules,
        caps_drop: CapabilityDrop::All,
        no_new_privileges: true,
        no_root: true,
        restrict_namespaces: true,
        protocols: settings.protocols.iter().copied().collect(),
        interpreters: settings.interpreters.clone(),
    };
    policy.check_invariants()?;
    Ok(policy)
}

fn require_absolute(what: &str, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(KernelError::Config(format!("{what} path is missing")));
    }
    if !path.is_absolute() {
        return Err(KernelError::Config(format!(
            "{what} path '{}' must be absolute",
            path.display()
        )));
    }
    Ok(())
}

impl SandboxPolicy {
    /// Effective access for `path`.
    ///
    /// The most restrictive matching rule wins (deny > noexec > read-only >
    /// read-write), with one carve-out: a read-only rule is shadowed by a
    /// read-write rule on a deeper path, which is how the working tree is
    /// writable inside a read-only home. Returns `None` when no rule matches.
    pub fn resolve(&self, path: &Path) -> Option<FsAccess> {
        let matching: Vec<&FsRule> = self.fs_rules.iter().filter(|r| r.matches(path)).collect();
        let deepest_rw = matching
            .iter()
            .filter(|r| r.access == FsAccess::ReadWrite)
            .map(|r| r.path.components().count())
            .max();
        matching
            .iter()
            .filter(|r| {
                !(r.access == FsAccess::ReadOnly
                    && deepest_rw.is_some_and(|depth| depth > r.path.components().count()))
            })
            .map(|r| r.access)
            .max()
    }

    pub fn is_interpreter_allowed(&self, program: &Path) -> bool {
        self.interpreters.iter().any(|allowed| allowed == program)
    }

    pub fn allows_protocol(&self, protocol: NetworkProtocol) -> bool {
        self.protocols.contains(&protocol)
    }

    /// The ordered directive list handed to the enforcement layer.
    pub fn document(&self) -> PolicyDocument {
        let mut directives: Vec<Directive> = self
            .fs_rules
            .iter()
            .cloned()
            .map(Directive::Filesystem)
            .collect();
        directives.push(Directive::CapsDrop {
            caps: self.caps_drop,
        });
        if self.no_root {
            directives.push(Directive::NoRoot);
        }
        if self.no_new_privileges {
            directives.push(Directive::NoNewPrivileges);
        }
        if self.restrict_namespaces {
            directives.push(Directive::RestrictNamespaces);
        }
        directives.push(Directive::Protocols {
            allow: self.protocols.iter().copied().collect(),
        });
        directives.push(Directive::Interpreters {
            allow: self.interpreters.clone(),
        });
        PolicyDocument {
            version: POLICY_VERSION,
            directives,
        }
    }

    fn check_invariants(&self) -> Result<()> {
        if self.resolve(&self.base.module_root) != Some(FsAccess::NoExec) {
            return Err(KernelError::Config(format!(
                "module root {} must resolve to noexec",
                self.base.module_root.display()
            )));
        }
        if !self.no_new_privileges || !self.no_root {
            return Err(KernelError::Config(
                "privilege escalation must be disabled".into(),
            ));
        }
        Ok(())
    }
}
