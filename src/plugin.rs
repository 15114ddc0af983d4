//! Attachment orchestrator
//!
//! Runs the ADD sequence as an ordered list of fallible steps. Each step
//! that leaves something behind registers its own undo on the rollback
//! stack, so a failure at any point unwinds exactly the work done so far.

use log::info;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::error::CniError;
use crate::ipam::{AllocationRequest, Allocator, FileAllocator};
use crate::names;
use crate::netns::NetnsHandle;
use crate::netops::{NetOps, NetlinkOps};
use crate::result::{self, CniResult};

/// Arguments for the ADD operation, taken from the CNI environment
pub struct AddArgs {
    pub container_id: String,
    pub netns_path: String,
    pub ifname: String,
    pub stdin_data: Vec<u8>,
}

/// Arguments for the DEL operation
pub struct DelArgs {
    pub container_id: String,
    pub stdin_data: Vec<u8>,
}

/// Library entrypoint for CNI operations. Backends are plain fields so
/// tests can swap in doubles.
pub struct Plugin {
    pub net_ops: Box<dyn NetOps>,
    pub ipam: Box<dyn Allocator>,
}

impl Plugin {
    /// Wire the default Linux netlink backend and file-backed IPAM
    pub fn new() -> Self {
        Self {
            net_ops: Box::new(NetlinkOps::new()),
            ipam: Box::new(FileAllocator::new()),
        }
    }

    /// Perform CNI ADD: bridge, veth pair, namespace move, IPAM, and
    /// in-container address/route setup, returning the CNI result.
    pub fn add(&self, cancel: &CancellationToken, args: &AddArgs) -> Result<CniResult, CniError> {
        let cfg = config::parse(&args.stdin_data).map_err(|e| e.tag("parse-config"))?;

        let target_ns = NetnsHandle::open(&args.netns_path).map_err(|e| e.tag("open-netns"))?;

        let gateway_cidr = config::ipv4_net(cfg.gateway, cfg.subnet.prefix_len())
            .map_err(|e| e.tag("ensure-bridge"))?;
        self.net_ops
            .ensure_bridge(&cfg.bridge, gateway_cidr)
            .map_err(|e| e.tag("ensure-bridge"))?;

        let host_veth = names::host_veth_name(&args.container_id);
        let peer_temp = names::peer_veth_temp_name(&args.container_id);

        let mut rollback = RollbackStack::new();

        if let Err(e) = self.net_ops.create_veth_pair(&host_veth, &peer_temp, cfg.mtu) {
            rollback.run();
            return Err(e.tag("create-veth"));
        }
        // Deleting one end destroys the pair
        rollback.push(|| {
            let _ = self.net_ops.delete_link(&host_veth);
        });

        if let Err(e) = self
            .net_ops
            .attach_host_veth_to_bridge(&host_veth, &cfg.bridge)
        {
            rollback.run();
            return Err(e.tag("attach-host-veth"));
        }

        if let Err(e) = self.net_ops.move_to_namespace(&peer_temp, &target_ns) {
            rollback.run();
            return Err(e.tag("move-peer-to-netns"));
        }
        // Either name may exist depending on whether the rename happened
        rollback.push(|| {
            let _ = self.net_ops.delete_link_in_ns(&target_ns, &args.ifname);
            let _ = self.net_ops.delete_link_in_ns(&target_ns, &peer_temp);
        });

        let container_mac =
            match self
                .net_ops
                .prepare_container_link(&target_ns, &peer_temp, &args.ifname)
            {
                Ok(mac) => mac,
                Err(e) => {
                    rollback.run();
                    return Err(e.tag("prepare-container-link"));
                }
            };

        let request = AllocationRequest {
            data_dir: cfg.ipam.data_dir.clone(),
            network: cfg.name.clone(),
            container_id: args.container_id.clone(),
            subnet: cfg.subnet,
            gateway: cfg.gateway,
            range_start: cfg.ipam.range_start,
            range_end: cfg.ipam.range_end,
        };
        let allocated = match self.ipam.allocate(cancel, &request) {
            Ok(ip) => ip,
            Err(e) => {
                rollback.run();
                return Err(e.tag("alloc-ip"));
            }
        };
        rollback.push(|| {
            let _ = self.ipam.release(
                &CancellationToken::new(),
                &cfg.ipam.data_dir,
                &cfg.name,
                &args.container_id,
            );
        });

        let pod_cidr = match config::ipv4_net(allocated, cfg.subnet.prefix_len()) {
            Ok(net) => net,
            Err(e) => {
                rollback.run();
                return Err(e.tag("configure-container-ip"));
            }
        };
        if let Err(e) =
            self.net_ops
                .add_address_and_route(&target_ns, &args.ifname, pod_cidr, cfg.gateway)
        {
            rollback.run();
            return Err(e.tag("configure-container-ip"));
        }

        let host_mac = match self.net_ops.get_link_mac(&host_veth) {
            Ok(mac) => mac,
            Err(e) => {
                rollback.run();
                return Err(e.tag("read-host-mac"));
            }
        };

        info!(
            "attached container {} ({}) to bridge {} with {}",
            args.container_id,
            target_ns.path().display(),
            cfg.bridge,
            pod_cidr
        );

        Ok(result::build_add_result(
            &cfg.cni_version,
            &host_veth,
            &host_mac,
            &args.ifname,
            &container_mac,
            &args.netns_path,
            pod_cidr,
            cfg.gateway,
        ))
    }

    /// Placeholder teardown: releases the container's address reservation.
    pub fn del(&self, cancel: &CancellationToken, args: &DelArgs) -> Result<(), CniError> {
        let cfg = config::parse(&args.stdin_data).map_err(|e| e.tag("parse-config"))?;

        self.ipam
            .release(cancel, &cfg.ipam.data_dir, &cfg.name, &args.container_id)
            .map_err(|e| e.tag("release-ip"))?;

        info!(
            "released any address reservation for container {}",
            args.container_id
        );
        Ok(())
    }
}

impl Default for Plugin {
    fn default() -> Self {
        Self::new()
    }
}

/// LIFO stack of cleanup actions, registered incrementally during ADD.
///
/// Consumed only on the error path; on success it is abandoned without
/// execution. Individual action failures are swallowed by the closures
/// themselves, so the original cause is what surfaces.
struct RollbackStack<'a> {
    actions: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a> RollbackStack<'a> {
    fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    fn push(&mut self, action: impl FnOnce() + 'a) {
        self.actions.push(Box::new(action));
    }

    fn run(self) {
        for action in self.actions.into_iter().rev() {
            action();
        }
    }
}
