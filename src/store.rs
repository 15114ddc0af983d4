//! IPAM state persistence
//!
//! One JSON state file and one zero-byte lock file per network, both under
//! the configured data directory. All state I/O happens while holding an
//! exclusive advisory lock on `{network}.lock`; writes go to a temp file
//! that is atomically renamed over `{network}.json`.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::CniError;

/// Persisted per-network allocation record.
///
/// `container_to_ip` and `ip_to_container` are mutual inverses; unknown
/// fields written by newer versions are accepted on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationState {
    #[serde(rename = "containerToIP", default)]
    pub container_to_ip: HashMap<String, String>,

    #[serde(rename = "ipToContainer", default)]
    pub ip_to_container: HashMap<String, String>,

    #[serde(rename = "lastReserved", default, skip_serializing_if = "Option::is_none")]
    pub last_reserved: Option<String>,
}

/// Exclusive advisory lock on one network's state.
///
/// Held for the full read-modify-write critical section; released and
/// closed when dropped, on every exit path.
pub struct NetworkLock {
    file: File,
}

impl NetworkLock {
    /// Create the data directory if needed, take the per-network lock, and
    /// return the lock guard together with the state file path.
    pub fn acquire(data_dir: &Path, network: &str) -> Result<(Self, PathBuf), CniError> {
        fs::create_dir_all(data_dir).map_err(|e| {
            CniError::ipam_error("failed to create IPAM data directory")
                .with_details(&e.to_string())
        })?;

        let lock_path = data_dir.join(format!("{}.lock", network));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o644)
            .open(&lock_path)
            .map_err(|e| {
                CniError::ipam_error("failed to open IPAM lock file").with_details(&e.to_string())
            })?;

        file.lock_exclusive().map_err(|e| {
            CniError::ipam_error("failed to acquire IPAM lock").with_details(&e.to_string())
        })?;

        let state_path = data_dir.join(format!("{}.json", network));
        Ok((Self { file }, state_path))
    }
}

impl Drop for NetworkLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Load state from disk. A missing or empty file is an empty state; a
/// file that exists but does not parse is an error, never auto-repaired.
pub fn load_state(path: &Path) -> Result<AllocationState, CniError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(AllocationState::default()),
        Err(e) => {
            return Err(
                CniError::ipam_error("failed to read IPAM state file").with_details(&e.to_string())
            )
        }
    };

    if content.is_empty() {
        return Ok(AllocationState::default());
    }

    serde_json::from_str(&content).map_err(|e| {
        CniError::ipam_error(&format!("ipam state file {} is corrupted", path.display()))
            .with_details(&e.to_string())
    })
}

/// Atomically persist state using write-then-rename.
pub fn save_state(path: &Path, state: &AllocationState) -> Result<(), CniError> {
    let content = serde_json::to_string_pretty(state).map_err(|e| {
        CniError::ipam_error("failed to serialize IPAM state").with_details(&e.to_string())
    })?;

    let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o644)
        .open(&tmp_path)
        .map_err(|e| {
            CniError::ipam_error("failed to create IPAM temp file").with_details(&e.to_string())
        })?;

    file.write_all(content.as_bytes()).map_err(|e| {
        CniError::ipam_error("failed to write IPAM temp file").with_details(&e.to_string())
    })?;

    file.sync_all().map_err(|e| {
        CniError::ipam_error("failed to sync IPAM temp file").with_details(&e.to_string())
    })?;
    drop(file);

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(
            CniError::ipam_error("failed to replace IPAM state file").with_details(&e.to_string())
        );
    }
    Ok(())
}
