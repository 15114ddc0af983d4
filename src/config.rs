//! CNI network configuration parsing
//!
//! Decodes the JSON document the runtime writes to stdin, applies defaults,
//! and validates the result. Validation stops at the first failing rule so
//! error messages point at exactly one problem.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use ipnet::{IpNet, Ipv4Net};
use serde::Deserialize;

use crate::error::CniError;

/// Default MTU applied when the config omits one
pub const DEFAULT_MTU: u32 = 1500;

/// Default directory for per-network IPAM state
pub const DEFAULT_DATA_DIR: &str = "/var/lib/atomicni";

/// Raw stdin shape. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNetworkConfig {
    #[serde(default)]
    cni_version: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    plugin_type: String,
    #[serde(default)]
    bridge: String,
    #[serde(default)]
    subnet: String,
    #[serde(default)]
    gateway: String,
    mtu: Option<u32>,
    #[serde(default)]
    ipam: RawIpamConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIpamConfig {
    #[serde(default)]
    data_dir: String,
    range_start: Option<String>,
    range_end: Option<String>,
}

/// Validated plugin configuration. Immutable after `parse`.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub cni_version: String,
    pub name: String,
    pub plugin_type: String,
    pub bridge: String,
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub mtu: u32,
    pub ipam: IpamConfig,
}

/// Validated IPAM section with the allocation range materialized
#[derive(Debug, Clone)]
pub struct IpamConfig {
    pub data_dir: PathBuf,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
}

/// Parse, default, and validate the CNI plugin config.
pub fn parse(stdin: &[u8]) -> Result<NetworkConfig, CniError> {
    let raw: RawNetworkConfig = serde_json::from_slice(stdin).map_err(|e| {
        CniError::decode_error("failed to parse network config").with_details(&e.to_string())
    })?;

    if raw.bridge.is_empty() {
        return Err(CniError::config_error("bridge is required"));
    }
    if raw.name.is_empty() {
        return Err(CniError::config_error("name is required"));
    }
    if raw.subnet.is_empty() {
        return Err(CniError::config_error("subnet is required"));
    }
    if raw.gateway.is_empty() {
        return Err(CniError::config_error("gateway is required"));
    }

    let mtu = raw.mtu.filter(|m| *m > 0).unwrap_or(DEFAULT_MTU);
    let data_dir = if raw.ipam.data_dir.is_empty() {
        PathBuf::from(DEFAULT_DATA_DIR)
    } else {
        PathBuf::from(&raw.ipam.data_dir)
    };

    let gateway = parse_ipv4("gateway", &raw.gateway)?;
    let subnet = parse_ipv4_net("subnet", &raw.subnet)?;

    if !subnet.contains(&gateway) {
        return Err(CniError::config_error("gateway must be inside subnet"));
    }
    if gateway == subnet.network() || gateway == subnet.broadcast() {
        return Err(CniError::config_error(
            "gateway cannot be network or broadcast address",
        ));
    }

    let range_start = raw
        .ipam
        .range_start
        .as_deref()
        .map(|s| parse_ipv4("ipam.rangeStart", s))
        .transpose()?;
    let range_end = raw
        .ipam
        .range_end
        .as_deref()
        .map(|s| parse_ipv4("ipam.rangeEnd", s))
        .transpose()?;

    if range_start.is_some() != range_end.is_some() {
        return Err(CniError::config_error(
            "ipam.rangeStart and ipam.rangeEnd must be set together",
        ));
    }

    let (range_start, range_end) = match (range_start, range_end) {
        (Some(start), Some(end)) => (start, end),
        _ => default_range(&subnet)?,
    };

    if !subnet.contains(&range_start) || !subnet.contains(&range_end) {
        return Err(CniError::config_error("ipam range must be inside subnet"));
    }
    if u32::from(range_start) > u32::from(range_end) {
        return Err(CniError::config_error("ipam rangeStart must be <= rangeEnd"));
    }
    if range_start == subnet.network() || range_start == subnet.broadcast() {
        return Err(CniError::config_error(
            "ipam rangeStart cannot be network or broadcast",
        ));
    }
    if range_end == subnet.network() || range_end == subnet.broadcast() {
        return Err(CniError::config_error(
            "ipam rangeEnd cannot be network or broadcast",
        ));
    }

    Ok(NetworkConfig {
        cni_version: raw.cni_version,
        name: raw.name,
        plugin_type: raw.plugin_type,
        bridge: raw.bridge,
        subnet,
        gateway,
        mtu,
        ipam: IpamConfig {
            data_dir,
            range_start,
            range_end,
        },
    })
}

/// Combine an IPv4 address with a prefix length into a CIDR value.
pub fn ipv4_net(addr: Ipv4Addr, prefix_len: u8) -> Result<Ipv4Net, CniError> {
    Ipv4Net::new(addr, prefix_len)
        .map_err(|_| CniError::config_error(&format!("invalid prefix length /{}", prefix_len)))
}

/// Strictly IPv4: mapped IPv6 forms such as `::ffff:10.0.0.1` are rejected.
fn parse_ipv4(field: &str, value: &str) -> Result<Ipv4Addr, CniError> {
    match value.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Ok(ip),
        Ok(IpAddr::V6(_)) => Err(CniError::config_error(&format!(
            "{}: only IPv4 is supported",
            field
        ))),
        Err(_) => Err(CniError::config_error(&format!(
            "{}: invalid IP address",
            field
        ))),
    }
}

fn parse_ipv4_net(field: &str, value: &str) -> Result<Ipv4Net, CniError> {
    match value.parse::<IpNet>() {
        Ok(IpNet::V4(net)) => Ok(net.trunc()),
        Ok(IpNet::V6(_)) => Err(CniError::config_error(&format!(
            "{}: only IPv4 is supported",
            field
        ))),
        Err(_) => Err(CniError::config_error(&format!("{}: invalid CIDR", field))),
    }
}

/// Default allocation range: first host through last host of the subnet.
fn default_range(subnet: &Ipv4Net) -> Result<(Ipv4Addr, Ipv4Addr), CniError> {
    if 32 - subnet.prefix_len() < 2 {
        return Err(CniError::config_error(
            "subnet does not provide usable host addresses",
        ));
    }
    let start = Ipv4Addr::from(u32::from(subnet.network()) + 1);
    let end = Ipv4Addr::from(u32::from(subnet.broadcast()) - 1);
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> &'static str {
        r#"{
            "cniVersion":"1.1.0",
            "name":"atomic-net",
            "type":"atomicni",
            "bridge":"atomic0",
            "subnet":"10.22.0.0/24",
            "gateway":"10.22.0.1"
        }"#
    }

    #[test]
    fn test_parse_valid_config_defaults() {
        let cfg = parse(minimal_config().as_bytes()).unwrap();
        assert_eq!(cfg.cni_version, "1.1.0");
        assert_eq!(cfg.name, "atomic-net");
        assert_eq!(cfg.plugin_type, "atomicni");
        assert_eq!(cfg.bridge, "atomic0");
        assert_eq!(cfg.mtu, DEFAULT_MTU);
        assert_eq!(cfg.ipam.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(cfg.ipam.range_start, "10.22.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(cfg.ipam.range_end, "10.22.0.254".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_parse_explicit_values() {
        let stdin = r#"{
            "cniVersion":"1.1.0",
            "name":"atomic-net",
            "type":"atomicni",
            "bridge":"atomic0",
            "subnet":"10.22.0.7/24",
            "gateway":"10.22.0.1",
            "mtu":9000,
            "ipam":{"dataDir":"/tmp/atomicni","rangeStart":"10.22.0.10","rangeEnd":"10.22.0.20"}
        }"#;

        let cfg = parse(stdin.as_bytes()).unwrap();
        assert_eq!(cfg.mtu, 9000);
        // Host bits in the subnet field are masked off
        assert_eq!(cfg.subnet.to_string(), "10.22.0.0/24");
        assert_eq!(cfg.ipam.data_dir, PathBuf::from("/tmp/atomicni"));
        assert_eq!(cfg.ipam.range_start, "10.22.0.10".parse::<Ipv4Addr>().unwrap());
        assert_eq!(cfg.ipam.range_end, "10.22.0.20".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_parse_ignores_unknown_fields() {
        let stdin = r#"{
            "cniVersion":"1.1.0",
            "name":"atomic-net",
            "type":"atomicni",
            "bridge":"atomic0",
            "subnet":"10.22.0.0/24",
            "gateway":"10.22.0.1",
            "runtimeConfig":{"portMappings":[]},
            "dns":{"nameservers":["8.8.8.8"]}
        }"#;

        assert!(parse(stdin.as_bytes()).is_ok());
    }

    #[test]
    fn test_parse_rejects_missing_bridge() {
        let stdin = r#"{
            "cniVersion":"1.1.0",
            "name":"atomic-net",
            "type":"atomicni",
            "subnet":"10.22.0.0/24",
            "gateway":"10.22.0.1"
        }"#;

        let err = parse(stdin.as_bytes()).unwrap_err();
        assert!(err.message().contains("bridge is required"));
    }

    #[test]
    fn test_parse_rejects_gateway_outside_subnet() {
        let stdin = r#"{
            "cniVersion":"1.1.0",
            "name":"atomic-net",
            "type":"atomicni",
            "bridge":"atomic0",
            "subnet":"10.22.0.0/24",
            "gateway":"10.23.0.1"
        }"#;

        let err = parse(stdin.as_bytes()).unwrap_err();
        assert!(err.message().contains("gateway must be inside subnet"));
    }

    #[test]
    fn test_parse_rejects_gateway_at_network_address() {
        let stdin = r#"{
            "cniVersion":"1.1.0",
            "name":"atomic-net",
            "type":"atomicni",
            "bridge":"atomic0",
            "subnet":"10.22.0.0/24",
            "gateway":"10.22.0.0"
        }"#;

        let err = parse(stdin.as_bytes()).unwrap_err();
        assert!(err.message().contains("network or broadcast"));
    }

    #[test]
    fn test_parse_rejects_partial_range() {
        let stdin = r#"{
            "cniVersion":"1.1.0",
            "name":"atomic-net",
            "type":"atomicni",
            "bridge":"atomic0",
            "subnet":"10.22.0.0/24",
            "gateway":"10.22.0.1",
            "ipam":{"rangeStart":"10.22.0.10"}
        }"#;

        let err = parse(stdin.as_bytes()).unwrap_err();
        assert!(err.message().contains("must be set together"));
    }

    #[test]
    fn test_parse_rejects_inverted_range() {
        let stdin = r#"{
            "cniVersion":"1.1.0",
            "name":"atomic-net",
            "type":"atomicni",
            "bridge":"atomic0",
            "subnet":"10.22.0.0/24",
            "gateway":"10.22.0.1",
            "ipam":{"rangeStart":"10.22.0.50","rangeEnd":"10.22.0.10"}
        }"#;

        let err = parse(stdin.as_bytes()).unwrap_err();
        assert!(err.message().contains("rangeStart must be <= rangeEnd"));
    }

    #[test]
    fn test_parse_rejects_range_outside_subnet() {
        let stdin = r#"{
            "cniVersion":"1.1.0",
            "name":"atomic-net",
            "type":"atomicni",
            "bridge":"atomic0",
            "subnet":"10.22.0.0/24",
            "gateway":"10.22.0.1",
            "ipam":{"rangeStart":"10.23.0.10","rangeEnd":"10.23.0.20"}
        }"#;

        let err = parse(stdin.as_bytes()).unwrap_err();
        assert!(err.message().contains("inside subnet"));
    }

    #[test]
    fn test_parse_rejects_ipv6_subnet() {
        let stdin = r#"{
            "cniVersion":"1.1.0",
            "name":"atomic-net",
            "type":"atomicni",
            "bridge":"atomic0",
            "subnet":"2001:db8::/64",
            "gateway":"10.22.0.1"
        }"#;

        let err = parse(stdin.as_bytes()).unwrap_err();
        assert!(err.message().contains("only IPv4 is supported"));
    }

    #[test]
    fn test_parse_rejects_ipv6_gateway() {
        let stdin = r#"{
            "cniVersion":"1.1.0",
            "name":"atomic-net",
            "type":"atomicni",
            "bridge":"atomic0",
            "subnet":"10.22.0.0/24",
            "gateway":"2001:db8::1"
        }"#;

        let err = parse(stdin.as_bytes()).unwrap_err();
        assert!(err.message().contains("only IPv4 is supported"));
    }

    #[test]
    fn test_parse_rejects_ipv4_mapped_gateway() {
        let stdin = r#"{
            "cniVersion":"1.1.0",
            "name":"atomic-net",
            "type":"atomicni",
            "bridge":"atomic0",
            "subnet":"10.22.0.0/24",
            "gateway":"::ffff:10.22.0.1"
        }"#;

        let err = parse(stdin.as_bytes()).unwrap_err();
        assert!(err.message().contains("only IPv4 is supported"));
    }

    #[test]
    fn test_parse_rejects_tiny_subnet() {
        let stdin = r#"{
            "cniVersion":"1.1.0",
            "name":"atomic-net",
            "type":"atomicni",
            "bridge":"atomic0",
            "subnet":"10.22.0.0/31",
            "gateway":"10.22.0.0"
        }"#;

        // /31 fails before the gateway checks can pass anyway; accept either message
        assert!(parse(stdin.as_bytes()).is_err());
    }

    #[test]
    fn test_mtu_zero_falls_back_to_default() {
        let stdin = r#"{
            "cniVersion":"1.1.0",
            "name":"atomic-net",
            "type":"atomicni",
            "bridge":"atomic0",
            "subnet":"10.22.0.0/24",
            "gateway":"10.22.0.1",
            "mtu":0
        }"#;

        let cfg = parse(stdin.as_bytes()).unwrap();
        assert_eq!(cfg.mtu, DEFAULT_MTU);
    }
}
