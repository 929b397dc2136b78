//! Restart marker: a single-slot mailbox between the coordinator and the
//! supervisor.
//!
//! Sending writes the marker if none is pending; repeated sends coalesce into
//! the pending one. Receiving atomically claims the marker and clears it.

use anyhow::{anyhow, Context};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{now_s, KernelError, Result};

const MARKER_FILE: &str = "restart.request";
const CLAIMED_FILE: &str = ".restart.claimed";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartRequest {
    pub reason: String,
    pub requested_by: String,
    /// seconds since epoch
    pub requested_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    Queued,
    Coalesced,
}

#[derive(Clone, Debug)]
pub struct RestartMailbox {
    dir: PathBuf,
}

impl RestartMailbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(MARKER_FILE)
    }

    /// Request a relaunch. Never overwrites a pending request.
    pub fn send(&self, reason: &str, requested_by: &str) -> Result<SendOutcome> {
        std::fs::create_dir_all(&self.dir)?;
        let marker = self.marker_path();
        if marker.exists() {
            return Ok(SendOutcome::Coalesced);
        }

        let request = RestartRequest {
            reason: reason.to_string(),
            requested_by: requested_by.to_string(),
            requested_at: now_s(),
        };
        let mut suffix = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut suffix);
        let tmp = self
            .dir
            .join(format!(".restart.tmp-{}", hex::encode(suffix)));
        write_synced(&tmp, &serde_json::to_vec(&request)?)?;

        // hard_link fails if the marker already exists, which makes the
        // create-if-absent atomic against concurrent senders.
        let linked = std::fs::hard_link(&tmp, &marker);
        let _ = std::fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                log::info!("restart requested by {}: {}", requested_by, reason);
                Ok(SendOutcome::Queued)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(SendOutcome::Coalesced),
            Err(e) => Err(e.into()),
        }
    }

    /// The pending request, without consuming it.
    pub fn pending(&self) -> Result<Option<RestartRequest>> {
        let marker = self.marker_path();
        if !marker.exists() {
            return Ok(None);
        }
        Ok(Some(read_request(&marker)?))
    }

    /// Claim and clear the pending request.
    pub fn receive(&self) -> Result<Option<RestartRequest>> {
        let marker = self.marker_path();
        let claimed = self.dir.join(CLAIMED_FILE);
        match std::fs::rename(&marker, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let request = read_request(&claimed);
        std::fs::remove_file(&claimed)?;
        Ok(Some(request?))
    }
}

/// A marker that cannot be parsed still counts as a request; existence is
/// the signal.
fn read_request(path: &Path) -> Result<RestartRequest> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(KernelError::Storage(anyhow!(
                "restart marker {} vanished",
                path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&raw).unwrap_or_else(|_| RestartRequest {
        reason: "external marker".to_string(),
        requested_by: "unknown".to_string(),
        requested_at: marker_mtime(path),
    }))
}

fn marker_mtime(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or_else(now_s)
}

pub(crate) fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))
        .map_err(KernelError::Storage)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Write `bytes` to `path` via a synced temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    write_synced(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
