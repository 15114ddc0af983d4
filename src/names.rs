//! Deterministic interface naming
//!
//! Derives host-side and temporary peer veth names from the container ID.
//! The digest suffix keeps names stable across invocations so that repeated
//! ADDs and later cleanup address the same links.

use sha1::{Digest, Sha1};

/// Linux limit is 15 visible characters plus the null terminator
const LINUX_IFNAME_MAX_LEN: usize = 15;

/// Prefix for host-side veth names
const HOST_VETH_PREFIX: &str = "av";

/// Prefix for the temporary peer name before the in-namespace rename
const PEER_VETH_PREFIX: &str = "cv";

/// Deterministic host-side veth name for a container ID
pub fn host_veth_name(container_id: &str) -> String {
    deterministic_name(HOST_VETH_PREFIX, container_id)
}

/// Deterministic temporary peer veth name before the netns rename
pub fn peer_veth_temp_name(container_id: &str) -> String {
    deterministic_name(PEER_VETH_PREFIX, container_id)
}

fn deterministic_name(prefix: &str, key: &str) -> String {
    let digest = format!("{:x}", Sha1::digest(key.as_bytes()));
    let max_digest_len = LINUX_IFNAME_MAX_LEN.saturating_sub(prefix.len()).max(1);
    format!("{}{}", prefix, &digest[..max_digest_len.min(digest.len())])
}
