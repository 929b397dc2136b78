/// Error kinds surfaced by the module kernel.
///
/// Every operator-facing operation reports one of these. Internal helpers use
/// `anyhow` for cause chains and convert at the component boundary.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Malformed or missing required paths or settings. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// The sandboxing layer is missing on this host. There is no unsandboxed fallback.
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// Non-encrypted or malformed module URL. Rejected before any filesystem mutation.
    #[error("invalid module source '{url}': {reason}")]
    InvalidSource { url: String, reason: String },

    /// Another operation currently holds the module name.
    #[error("operation already in progress for module '{0}'")]
    AlreadyInProgress(String),

    /// Install failed; the partial directory was removed and no record exists.
    #[error("install of module '{name}' failed: {source:#}")]
    Install {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// The working tree cannot be fast-forwarded; nothing was changed.
    #[error("update of module '{name}' refused: {reason}")]
    UpdateConflict { name: String, reason: String },

    /// Not a usable module name. Rejected before any lookup.
    #[error("invalid module name '{0}'")]
    InvalidName(String),

    #[error("module '{0}' not found")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A network operation exceeded its bound. Retryable.
    #[error("fetch timed out after {secs}s: {what}")]
    FetchTimeout { what: String, secs: u64 },

    /// The in-flight install was cancelled by a superseding request.
    #[error("install of module '{0}' was cancelled")]
    Cancelled(String),

    /// The supervisor exhausted its restart budget.
    #[error("crash loop: {crashes} crashes within {window_secs}s (limit {limit})")]
    CrashLoopExceeded {
        crashes: usize,
        limit: usize,
        window_secs: u64,
    },

    /// Registry or filesystem I/O failure.
    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),
}

impl KernelError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KernelError::FetchTimeout { .. } | KernelError::AlreadyInProgress(_)
        )
    }

    /// Stable machine-readable kind, used in structured command results.
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::Config(_) => "config_error",
            KernelError::SandboxUnavailable(_) => "sandbox_unavailable",
            KernelError::InvalidSource { .. } => "invalid_source",
            KernelError::AlreadyInProgress(_) => "already_in_progress",
            KernelError::Install { .. } => "install_error",
            KernelError::UpdateConflict { .. } => "update_conflict",
            KernelError::InvalidName(_) => "invalid_name",
            KernelError::NotFound(_) => "not_found",
            KernelError::PermissionDenied(_) => "permission_denied",
            KernelError::FetchTimeout { .. } => "fetch_timeout",
            KernelError::Cancelled(_) => "cancelled",
            KernelError::CrashLoopExceeded { .. } => "crash_loop_exceeded",
            KernelError::Storage(_) => "storage_error",
        }
    }

    pub(crate) fn install(name: &str, source: anyhow::Error) -> Self {
        KernelError::Install {
            name: name.to_string(),
            source,
        }
    }
}

impl From<rusqlite::Error> for KernelError {
    fn from(err: rusqlite::Error) -> Self {
        KernelError::Storage(err.into())
    }
}

impl From<std::io::Error> for KernelError {
    fn from(err: std::io::Error) -> Self {
        KernelError::Storage(err.into())
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        KernelError::Storage(err.into())
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_and_contention_are_retryable() {
        assert!(KernelError::FetchTimeout {
            what: "clone".into(),
            secs: 1
        }
        .is_retryable());
        assert!(KernelError::AlreadyInProgress("mod".into()).is_retryable());
        assert!(!KernelError::install("mod", anyhow::anyhow!("boom")).is_retryable());
        assert!(!KernelError::NotFound("mod".into()).is_retryable());
    }

    #[test]
    fn install_error_carries_cause() {
        let err = KernelError::install("mod", anyhow::anyhow!("manifest missing"));
        assert_eq!(err.kind(), "install_error");
        assert!(err.to_string().contains("manifest missing"));
    }

    #[test]
    fn malformed_name_is_not_reported_as_missing() {
        let err = crate::installer::validate_module_name("../etc").unwrap_err();
        assert_eq!(err.kind(), "invalid_name");
        assert!(!err.is_retryable());
    }
}
