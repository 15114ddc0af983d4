//! Network namespace operations
//!
//! Handles and scoped entry for container network namespaces. Entering a
//! namespace affects only the calling thread; the guard restores the
//! original namespace on every exit path.

use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};

use crate::error::CniError;

/// Open handle to a target network namespace
#[derive(Debug)]
pub struct NetnsHandle {
    file: File,
    path: PathBuf,
}

impl NetnsHandle {
    /// Open a namespace by path (e.g. `/var/run/netns/<name>` or
    /// `/proc/<pid>/ns/net`).
    pub fn open(path: &str) -> Result<Self, CniError> {
        let file = File::open(path).map_err(|e| {
            CniError::namespace_error(&format!("failed to open network namespace: {}", path))
                .with_details(&e.to_string())
        })?;
        Ok(Self {
            file,
            path: PathBuf::from(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Guard that saves the current network namespace and restores it on drop
pub struct NetnsGuard {
    original_ns: File,
}

impl NetnsGuard {
    /// Enter the target namespace, saving the current one for restoration
    pub fn enter(target: &NetnsHandle) -> Result<Self, CniError> {
        let original_ns = File::open("/proc/self/ns/net").map_err(|e| {
            CniError::namespace_error("failed to open current network namespace")
                .with_details(&e.to_string())
        })?;

        setns(target.raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
            CniError::namespace_error("failed to enter network namespace")
                .with_details(&e.to_string())
        })?;

        Ok(Self { original_ns })
    }

    /// Restore the original namespace, surfacing failure to the caller
    pub fn restore(self) -> Result<(), CniError> {
        setns(self.original_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
            CniError::namespace_error("failed to restore original network namespace")
                .with_details(&e.to_string())
        })?;
        // Don't run Drop since we've already restored
        std::mem::forget(self);
        Ok(())
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        // Best effort restore; the process exits shortly after in CNI context
        let _ = setns(self.original_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET);
    }
}

/// Execute a closure with the calling thread inside the target namespace
pub fn with_netns<T, F>(target: &NetnsHandle, f: F) -> Result<T, CniError>
where
    F: FnOnce() -> Result<T, CniError>,
{
    let guard = NetnsGuard::enter(target)?;
    let result = f();
    guard.restore()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_own_netns() {
        let handle = NetnsHandle::open("/proc/self/ns/net").unwrap();
        assert_eq!(handle.path(), Path::new("/proc/self/ns/net"));
        assert!(handle.raw_fd() >= 0);
    }

    #[test]
    fn test_open_invalid_path_errors() {
        let err = NetnsHandle::open("/nonexistent/path/ns/net").unwrap_err();
        assert!(err.message().contains("failed to open network namespace"));
    }
}
