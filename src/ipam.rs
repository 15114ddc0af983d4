//! IP address management
//!
//! File-backed IPv4 allocation with per-network advisory locking. The
//! allocation policy is next-fit: the cursor resumes after the most
//! recently reserved address and wraps at the end of the range, so a
//! freed address is not handed straight back to the next container.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::error::CniError;
use crate::store::{self, AllocationState, NetworkLock};

/// One IPv4 allocation request. Immutable value object.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub data_dir: PathBuf,
    pub network: String,
    pub container_id: String,
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
}

/// Per-network IPv4 allocation service.
///
/// Cancellation is honored only before lock acquisition; once the lock is
/// held the critical section runs to completion.
pub trait Allocator {
    fn allocate(
        &self,
        cancel: &CancellationToken,
        req: &AllocationRequest,
    ) -> Result<Ipv4Addr, CniError>;

    /// Idempotent: releasing a container with no reservation succeeds.
    fn release(
        &self,
        cancel: &CancellationToken,
        data_dir: &Path,
        network: &str,
        container_id: &str,
    ) -> Result<(), CniError>;

    fn get_by_container(
        &self,
        cancel: &CancellationToken,
        data_dir: &Path,
        network: &str,
        container_id: &str,
    ) -> Result<Option<Ipv4Addr>, CniError>;
}

/// Allocator keeping its state on local disk.
#[derive(Debug, Default)]
pub struct FileAllocator;

impl FileAllocator {
    pub fn new() -> Self {
        Self
    }
}

impl Allocator for FileAllocator {
    fn allocate(
        &self,
        cancel: &CancellationToken,
        req: &AllocationRequest,
    ) -> Result<Ipv4Addr, CniError> {
        validate_request(req)?;
        if cancel.is_cancelled() {
            return Err(CniError::ipam_error("allocation cancelled"));
        }

        let (_lock, state_path) = NetworkLock::acquire(&req.data_dir, &req.network)?;
        let mut state = store::load_state(&state_path)?;

        // Idempotent per container: hand back the existing reservation and
        // heal the inverse mapping without advancing the cursor.
        if let Some(existing) = state.container_to_ip.get(&req.container_id).cloned() {
            let ip = parse_stored_ip(&req.container_id, &existing)?;
            state
                .ip_to_container
                .insert(existing, req.container_id.clone());
            store::save_state(&state_path, &state)?;
            debug!(
                "container {} already holds {} on network {}",
                req.container_id, ip, req.network
            );
            return Ok(ip);
        }

        let selected = find_next_ip(&state, req)?;
        let selected_str = selected.to_string();
        state
            .container_to_ip
            .insert(req.container_id.clone(), selected_str.clone());
        state
            .ip_to_container
            .insert(selected_str.clone(), req.container_id.clone());
        state.last_reserved = Some(selected_str);
        store::save_state(&state_path, &state)?;

        info!(
            "allocated {} to container {} on network {}",
            selected, req.container_id, req.network
        );
        Ok(selected)
    }

    fn release(
        &self,
        cancel: &CancellationToken,
        data_dir: &Path,
        network: &str,
        container_id: &str,
    ) -> Result<(), CniError> {
        if network.is_empty() || container_id.is_empty() {
            return Err(CniError::ipam_error("network and containerID are required"));
        }
        if cancel.is_cancelled() {
            return Err(CniError::ipam_error("release cancelled"));
        }

        let (_lock, state_path) = NetworkLock::acquire(data_dir, network)?;
        let mut state = store::load_state(&state_path)?;

        let Some(ip) = state.container_to_ip.remove(container_id) else {
            debug!("container {} had no reservation on network {}", container_id, network);
            return Ok(());
        };
        state.ip_to_container.remove(&ip);
        // lastReserved is left as-is so the cursor keeps moving forward
        store::save_state(&state_path, &state)?;

        info!("released {} from container {}", ip, container_id);
        Ok(())
    }

    fn get_by_container(
        &self,
        cancel: &CancellationToken,
        data_dir: &Path,
        network: &str,
        container_id: &str,
    ) -> Result<Option<Ipv4Addr>, CniError> {
        if network.is_empty() || container_id.is_empty() {
            return Err(CniError::ipam_error("network and containerID are required"));
        }
        if cancel.is_cancelled() {
            return Err(CniError::ipam_error("lookup cancelled"));
        }

        let (_lock, state_path) = NetworkLock::acquire(data_dir, network)?;
        let state = store::load_state(&state_path)?;

        match state.container_to_ip.get(container_id) {
            Some(stored) => Ok(Some(parse_stored_ip(container_id, stored)?)),
            None => Ok(None),
        }
    }
}

/// Next-fit search over `[range_start, range_end]`, skipping the subnet's
/// network and broadcast addresses, the gateway, and addresses in use.
fn find_next_ip(state: &AllocationState, req: &AllocationRequest) -> Result<Ipv4Addr, CniError> {
    let start = u32::from(req.range_start);
    let end = u32::from(req.range_end);
    let count = u64::from(end - start) + 1;

    let mut candidate = start;
    if let Some(last) = state
        .last_reserved
        .as_deref()
        .and_then(|s| s.parse::<Ipv4Addr>().ok())
    {
        let last = u32::from(last);
        if last >= start && last <= end {
            candidate = if last == end { start } else { last + 1 };
        }
    }

    let network = req.subnet.network();
    let broadcast = req.subnet.broadcast();

    for _ in 0..count {
        let ip = Ipv4Addr::from(candidate);
        candidate = if candidate == end { start } else { candidate + 1 };

        if ip == network || ip == broadcast || ip == req.gateway {
            continue;
        }
        if state.ip_to_container.contains_key(&ip.to_string()) {
            continue;
        }
        return Ok(ip);
    }

    Err(CniError::ipam_error("no available IP addresses"))
}

fn validate_request(req: &AllocationRequest) -> Result<(), CniError> {
    if req.data_dir.as_os_str().is_empty() {
        return Err(CniError::ipam_error("dataDir is required"));
    }
    if req.network.is_empty() {
        return Err(CniError::ipam_error("network is required"));
    }
    if req.container_id.is_empty() {
        return Err(CniError::ipam_error("containerID is required"));
    }
    if !req.subnet.contains(&req.range_start) || !req.subnet.contains(&req.range_end) {
        return Err(CniError::ipam_error("allocation range must be inside subnet"));
    }
    if u32::from(req.range_start) > u32::from(req.range_end) {
        return Err(CniError::ipam_error("rangeStart must be <= rangeEnd"));
    }
    Ok(())
}

fn parse_stored_ip(container_id: &str, value: &str) -> Result<Ipv4Addr, CniError> {
    value.parse().map_err(|_| {
        CniError::ipam_error(&format!(
            "stored IP for container {:?} is invalid: {:?}",
            container_id, value
        ))
    })
}
