//! Link operations
//!
//! The capability set the attachment orchestrator depends on, plus the
//! netlink-backed Linux implementation. Every operation is written to be
//! at-least-once safe: "already exists" and "already gone" outcomes are
//! success, so a retried ADD or a rollback never trips over earlier work.

use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;
use ipnet::Ipv4Net;
use log::{debug, warn};
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::{new_connection, Handle};
use tokio::runtime::Runtime;

use crate::config::DEFAULT_MTU;
use crate::error::CniError;
use crate::netns::{self, NetnsHandle};

/// Host and container link operations required by the plugin
pub trait NetOps {
    /// Create the bridge if missing, bring it up, and assign the gateway
    /// CIDR if absent. Idempotent; the bridge is shared and never deleted.
    fn ensure_bridge(&self, name: &str, gateway: Ipv4Net) -> Result<(), CniError>;

    /// Create a veth pair and apply the MTU to both ends. An existing host
    /// link is accepted; a non-positive MTU falls back to the default.
    fn create_veth_pair(&self, host: &str, peer: &str, mtu: u32) -> Result<(), CniError>;

    fn attach_host_veth_to_bridge(&self, host: &str, bridge: &str) -> Result<(), CniError>;

    /// Move a link into the target namespace. A missing link is success.
    fn move_to_namespace(&self, link: &str, target: &NetnsHandle) -> Result<(), CniError>;

    /// Rename the peer to its in-container name, bring it up, and return
    /// its MAC address.
    fn prepare_container_link(
        &self,
        target: &NetnsHandle,
        current: &str,
        target_name: &str,
    ) -> Result<String, CniError>;

    /// Assign the pod address and the default route via the gateway inside
    /// the target namespace.
    fn add_address_and_route(
        &self,
        target: &NetnsHandle,
        ifname: &str,
        addr: Ipv4Net,
        gateway: Ipv4Addr,
    ) -> Result<(), CniError>;

    /// Delete a host-namespace link. A missing link is success.
    fn delete_link(&self, name: &str) -> Result<(), CniError>;

    /// Delete a link inside the target namespace. A missing link is success.
    fn delete_link_in_ns(&self, target: &NetnsHandle, name: &str) -> Result<(), CniError>;

    fn get_link_mac(&self, name: &str) -> Result<String, CniError>;
}

/// Linux implementation of `NetOps` backed by rtnetlink
pub struct NetlinkOps;

impl NetlinkOps {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NetlinkOps {
    fn default() -> Self {
        Self::new()
    }
}

impl NetOps for NetlinkOps {
    fn ensure_bridge(&self, name: &str, gateway: Ipv4Net) -> Result<(), CniError> {
        let rt = runtime()?;
        rt.block_on(async {
            let handle = connect().await?;

            let index = match get_link_index(&handle, name).await? {
                Some(index) => {
                    debug!("bridge {} already exists (index {})", name, index);
                    index
                }
                None => {
                    match handle.link().add().bridge(name.to_string()).execute().await {
                        Ok(()) => {}
                        Err(e) if is_netlink_errno(&e, libc::EEXIST) => {
                            debug!("bridge {} created by another process", name);
                        }
                        Err(e) => {
                            return Err(CniError::bridge_error(&format!(
                                "failed to create bridge {}",
                                name
                            ))
                            .with_details(&e.to_string()))
                        }
                    }
                    get_link_index(&handle, name).await?.ok_or_else(|| {
                        CniError::bridge_error("bridge was created but not found")
                    })?
                }
            };

            set_link_up(&handle, index).await?;
            ensure_address(&handle, index, gateway).await
        })
    }

    fn create_veth_pair(&self, host: &str, peer: &str, mtu: u32) -> Result<(), CniError> {
        if host.is_empty() || peer.is_empty() {
            return Err(CniError::veth_error("host and peer names are required"));
        }
        let mtu = if mtu == 0 { DEFAULT_MTU } else { mtu };

        let rt = runtime()?;
        rt.block_on(async {
            let handle = connect().await?;

            if get_link_index(&handle, host).await?.is_some() {
                debug!("veth {} already exists, reusing", host);
                return Ok(());
            }

            match handle
                .link()
                .add()
                .veth(host.to_string(), peer.to_string())
                .execute()
                .await
            {
                Ok(()) => {}
                Err(e) if is_netlink_errno(&e, libc::EEXIST) => {
                    debug!("veth {} created by another process, reusing", host);
                }
                Err(e) => {
                    return Err(CniError::veth_error("failed to create veth pair")
                        .with_details(&e.to_string()))
                }
            }

            for name in [host, peer] {
                let index = get_link_index(&handle, name).await?.ok_or_else(|| {
                    CniError::veth_error(&format!("veth end {} not found after create", name))
                })?;
                handle
                    .link()
                    .set(index)
                    .mtu(mtu)
                    .execute()
                    .await
                    .map_err(|e| {
                        CniError::veth_error(&format!("failed to set MTU on {}", name))
                            .with_details(&e.to_string())
                    })?;
            }
            Ok(())
        })
    }

    fn attach_host_veth_to_bridge(&self, host: &str, bridge: &str) -> Result<(), CniError> {
        let rt = runtime()?;
        rt.block_on(async {
            let handle = connect().await?;

            let bridge_index = get_link_index(&handle, bridge).await?.ok_or_else(|| {
                CniError::bridge_error(&format!("bridge {} does not exist", bridge))
            })?;
            let host_index = get_link_index(&handle, host).await?.ok_or_else(|| {
                CniError::veth_error(&format!("host veth {} does not exist", host))
            })?;

            handle
                .link()
                .set(host_index)
                .controller(bridge_index)
                .execute()
                .await
                .map_err(|e| {
                    CniError::veth_error("failed to attach host veth to bridge")
                        .with_details(&e.to_string())
                })?;

            set_link_up(&handle, host_index).await
        })
    }

    fn move_to_namespace(&self, link: &str, target: &NetnsHandle) -> Result<(), CniError> {
        let rt = runtime()?;
        rt.block_on(async {
            let handle = connect().await?;

            let Some(index) = get_link_index(&handle, link).await? else {
                debug!("link {} already moved or missing", link);
                return Ok(());
            };

            handle
                .link()
                .set(index)
                .setns_by_fd(target.raw_fd())
                .execute()
                .await
                .map_err(|e| {
                    CniError::veth_error(&format!(
                        "failed to move {} to container namespace",
                        link
                    ))
                    .with_details(&e.to_string())
                })
        })
    }

    fn prepare_container_link(
        &self,
        target: &NetnsHandle,
        current: &str,
        target_name: &str,
    ) -> Result<String, CniError> {
        netns::with_netns(target, || {
            let rt = runtime()?;
            rt.block_on(async {
                let handle = connect().await?;

                if let Some(index) = get_link_index(&handle, current).await? {
                    handle
                        .link()
                        .set(index)
                        .name(target_name.to_string())
                        .execute()
                        .await
                        .map_err(|e| {
                            CniError::veth_error(&format!(
                                "failed to rename link to {}",
                                target_name
                            ))
                            .with_details(&e.to_string())
                        })?;
                }

                let link = get_link(&handle, target_name).await?.ok_or_else(|| {
                    CniError::veth_error(&format!(
                        "link {} not found in container",
                        target_name
                    ))
                })?;

                set_link_up(&handle, link.header.index).await?;

                link_mac(&link).ok_or_else(|| {
                    CniError::veth_error(&format!("link {} has no MAC address", target_name))
                })
            })
        })
    }

    fn add_address_and_route(
        &self,
        target: &NetnsHandle,
        ifname: &str,
        addr: Ipv4Net,
        gateway: Ipv4Addr,
    ) -> Result<(), CniError> {
        netns::with_netns(target, || {
            let rt = runtime()?;
            rt.block_on(async {
                let handle = connect().await?;

                let index = get_link_index(&handle, ifname).await?.ok_or_else(|| {
                    CniError::veth_error(&format!("interface {} not found in container", ifname))
                })?;

                // Loopback is brought up best-effort
                if let Some(lo_index) = get_link_index(&handle, "lo").await? {
                    if let Err(e) = handle.link().set(lo_index).up().execute().await {
                        warn!("failed to bring loopback up: {}", e);
                    }
                }

                match handle
                    .address()
                    .add(index, IpAddr::V4(addr.addr()), addr.prefix_len())
                    .execute()
                    .await
                {
                    Ok(()) => {}
                    Err(e) if is_netlink_errno(&e, libc::EEXIST) => {
                        debug!("address {} already present on {}", addr, ifname);
                    }
                    Err(e) => {
                        return Err(CniError::ipam_error(&format!(
                            "failed to assign address {}",
                            addr
                        ))
                        .with_details(&e.to_string()))
                    }
                }

                match handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
                    .gateway(gateway)
                    .output_interface(index)
                    .execute()
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(e) if is_netlink_errno(&e, libc::EEXIST) => {
                        debug!("default route already exists");
                        Ok(())
                    }
                    Err(e) => Err(CniError::route_error(&format!(
                        "failed to add default route via {}",
                        gateway
                    ))
                    .with_details(&e.to_string())),
                }
            })
        })
    }

    fn delete_link(&self, name: &str) -> Result<(), CniError> {
        let rt = runtime()?;
        rt.block_on(async {
            let handle = connect().await?;
            delete_if_present(&handle, name).await
        })
    }

    fn delete_link_in_ns(&self, target: &NetnsHandle, name: &str) -> Result<(), CniError> {
        netns::with_netns(target, || {
            let rt = runtime()?;
            rt.block_on(async {
                let handle = connect().await?;
                delete_if_present(&handle, name).await
            })
        })
    }

    fn get_link_mac(&self, name: &str) -> Result<String, CniError> {
        let rt = runtime()?;
        rt.block_on(async {
            let handle = connect().await?;
            let link = get_link(&handle, name)
                .await?
                .ok_or_else(|| CniError::veth_error(&format!("link {} does not exist", name)))?;
            link_mac(&link)
                .ok_or_else(|| CniError::veth_error(&format!("link {} has no MAC address", name)))
        })
    }
}

fn runtime() -> Result<Runtime, CniError> {
    Runtime::new().map_err(|e| {
        CniError::io_error("failed to create tokio runtime").with_details(&e.to_string())
    })
}

async fn connect() -> Result<Handle, CniError> {
    let (connection, handle, _) = new_connection().map_err(|e| {
        CniError::io_error("failed to create netlink connection").with_details(&e.to_string())
    })?;
    tokio::spawn(connection);
    Ok(handle)
}

async fn get_link(handle: &Handle, name: &str) -> Result<Option<LinkMessage>, CniError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();

    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(e) if is_netlink_errno(&e, libc::ENODEV) => Ok(None),
        Err(e) => Err(
            CniError::io_error(&format!("failed to get link {}", name))
                .with_details(&e.to_string()),
        ),
    }
}

async fn get_link_index(handle: &Handle, name: &str) -> Result<Option<u32>, CniError> {
    Ok(get_link(handle, name).await?.map(|link| link.header.index))
}

async fn set_link_up(handle: &Handle, index: u32) -> Result<(), CniError> {
    handle.link().set(index).up().execute().await.map_err(|e| {
        CniError::veth_error("failed to bring link up").with_details(&e.to_string())
    })
}

async fn delete_if_present(handle: &Handle, name: &str) -> Result<(), CniError> {
    let Some(index) = get_link_index(handle, name).await? else {
        debug!("link {} already deleted or never existed", name);
        return Ok(());
    };
    handle.link().del(index).execute().await.map_err(|e| {
        CniError::veth_error(&format!("failed to delete link {}", name))
            .with_details(&e.to_string())
    })
}

/// Add the CIDR to the interface unless an address with the same IP is
/// already assigned.
async fn ensure_address(handle: &Handle, index: u32, cidr: Ipv4Net) -> Result<(), CniError> {
    let mut addresses = handle
        .address()
        .get()
        .set_link_index_filter(index)
        .execute();
    while let Some(msg) = addresses.try_next().await.map_err(|e| {
        CniError::io_error("failed to list addresses").with_details(&e.to_string())
    })? {
        for attr in &msg.attributes {
            if let AddressAttribute::Address(existing) = attr {
                if *existing == IpAddr::V4(cidr.addr()) {
                    debug!("address {} already present", cidr);
                    return Ok(());
                }
            }
        }
    }

    match handle
        .address()
        .add(index, IpAddr::V4(cidr.addr()), cidr.prefix_len())
        .execute()
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if is_netlink_errno(&e, libc::EEXIST) => Ok(()),
        Err(e) => Err(
            CniError::bridge_error(&format!("failed to add address {}", cidr))
                .with_details(&e.to_string()),
        ),
    }
}

fn is_netlink_errno(err: &rtnetlink::Error, code: i32) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(e) if e.raw_code() == -code)
}

fn link_mac(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(bytes) => Some(format_mac(bytes)),
        _ => None,
    })
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mac() {
        assert_eq!(
            format_mac(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            "aa:bb:cc:dd:ee:ff"
        );
        assert_eq!(format_mac(&[0x00, 0x01]), "00:01");
    }
}
