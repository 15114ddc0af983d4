//! CNI result types
//!
//! Output formats for CNI operations, plus the ADD result assembly.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Result returned by the ADD operation
///
/// See: https://github.com/containernetworking/cni/blob/main/SPEC.md#add-success
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    /// CNI specification version
    pub cni_version: String,

    /// Interfaces created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,

    /// IP addresses assigned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IpConfig>>,

    /// Routes configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<RouteConfig>>,
}

impl CniResult {
    pub fn new(cni_version: String) -> Self {
        Self {
            cni_version,
            interfaces: None,
            ips: None,
            routes: None,
        }
    }

    /// Add an interface to the result
    pub fn with_interface(mut self, name: String, mac: String, sandbox: Option<String>) -> Self {
        let iface = Interface { name, mac, sandbox };
        match &mut self.interfaces {
            Some(interfaces) => interfaces.push(iface),
            None => self.interfaces = Some(vec![iface]),
        }
        self
    }

    /// Add an IP configuration pointing at an interface index
    pub fn with_ip(mut self, address: String, gateway: Option<String>, interface: usize) -> Self {
        let ip = IpConfig {
            address,
            gateway,
            interface: Some(interface),
        };
        match &mut self.ips {
            Some(ips) => ips.push(ip),
            None => self.ips = Some(vec![ip]),
        }
        self
    }

    /// Add a route to the result
    pub fn with_route(mut self, dst: String, gw: Option<String>) -> Self {
        let route = RouteConfig { dst, gw };
        match &mut self.routes {
            Some(routes) => routes.push(route),
            None => self.routes = Some(vec![route]),
        }
        self
    }
}

/// Network interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub mac: String,

    /// Network namespace path, set only for container-side interfaces
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP address configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpConfig {
    /// IP address in CIDR notation
    pub address: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// Index into the interfaces array
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Destination network in CIDR notation
    pub dst: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// Result returned by the VERSION operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult {
    pub cni_version: String,
    pub supported_versions: Vec<String>,
}

/// Assemble the result for a successful ADD: host interface first,
/// container interface second (with sandbox), one IP entry bound to the
/// container side, and the default route via the gateway.
#[allow(clippy::too_many_arguments)]
pub fn build_add_result(
    cni_version: &str,
    host_name: &str,
    host_mac: &str,
    container_name: &str,
    container_mac: &str,
    netns_path: &str,
    address: Ipv4Net,
    gateway: Ipv4Addr,
) -> CniResult {
    CniResult::new(cni_version.to_string())
        .with_interface(host_name.to_string(), host_mac.to_string(), None)
        .with_interface(
            container_name.to_string(),
            container_mac.to_string(),
            Some(netns_path.to_string()),
        )
        .with_ip(address.to_string(), Some(gateway.to_string()), 1)
        .with_route("0.0.0.0/0".to_string(), Some(gateway.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_add_result_shape() {
        let result = build_add_result(
            "1.1.0",
            "av123",
            "aa:bb:cc:dd:ee:ff",
            "eth0",
            "11:22:33:44:55:66",
            "/var/run/netns/test",
            "10.22.0.10/24".parse().unwrap(),
            "10.22.0.1".parse().unwrap(),
        );

        assert_eq!(result.cni_version, "1.1.0");

        let interfaces = result.interfaces.as_ref().unwrap();
        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces[0].name, "av123");
        assert_eq!(interfaces[0].mac, "aa:bb:cc:dd:ee:ff");
        assert!(interfaces[0].sandbox.is_none());
        assert_eq!(interfaces[1].name, "eth0");
        assert_eq!(interfaces[1].mac, "11:22:33:44:55:66");
        assert_eq!(interfaces[1].sandbox.as_deref(), Some("/var/run/netns/test"));

        let ips = result.ips.as_ref().unwrap();
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0].address, "10.22.0.10/24");
        assert_eq!(ips[0].gateway.as_deref(), Some("10.22.0.1"));
        assert_eq!(ips[0].interface, Some(1));

        let routes = result.routes.as_ref().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dst, "0.0.0.0/0");
        assert_eq!(routes[0].gw.as_deref(), Some("10.22.0.1"));
    }

    #[test]
    fn test_result_serialization() {
        let result = build_add_result(
            "1.1.0",
            "av123",
            "aa:bb:cc:dd:ee:ff",
            "eth0",
            "11:22:33:44:55:66",
            "/var/run/netns/test",
            "10.22.0.10/24".parse().unwrap(),
            "10.22.0.1".parse().unwrap(),
        );

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"cniVersion\":\"1.1.0\""));
        assert!(json.contains("\"interfaces\""));
        assert!(json.contains("\"sandbox\":\"/var/run/netns/test\""));
        assert!(json.contains("\"address\":\"10.22.0.10/24\""));
    }

    #[test]
    fn test_version_result_serialization() {
        let result = VersionResult {
            cni_version: "1.1.0".to_string(),
            supported_versions: vec!["1.0.0".to_string(), "1.1.0".to_string()],
        };

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"cniVersion\":\"1.1.0\""));
        assert!(json.contains("\"supportedVersions\""));
    }
}
