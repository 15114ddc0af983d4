//! CNI error types
//!
//! Error codes and types as defined in CNI Spec 1.1.0, plus the
//! plugin-specific codes used by the attachment and IPAM paths.

use thiserror::Error;

/// CNI error codes as defined in the specification
///
/// See: https://github.com/containernetworking/cni/blob/main/SPEC.md#error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(dead_code)] // Some variants reserved for future use
pub enum CniErrorCode {
    /// 1: Incompatible CNI version
    IncompatibleVersion = 1,

    /// 2: Unsupported field in network configuration
    UnsupportedField = 2,

    /// 3: Container unknown or does not exist
    UnknownContainer = 3,

    /// 4: Invalid necessary environment variables
    InvalidEnvironmentVariables = 4,

    /// 5: I/O failure
    IoFailure = 5,

    /// 6: Failed to decode content
    DecodingFailure = 6,

    /// 7: Invalid network config
    InvalidNetworkConfig = 7,

    /// 11: Try again later
    TryAgainLater = 11,

    // Plugin-specific errors (100+)

    /// 100: Bridge operation failed
    BridgeFailure = 100,

    /// 101: Veth operation failed
    VethFailure = 101,

    /// 102: IPAM failure
    IpamFailure = 102,

    /// 103: Namespace operation failed
    NamespaceFailure = 103,

    /// 104: Route configuration failed
    RouteFailure = 104,
}

/// CNI error with code, message, and optional details
#[derive(Debug, Error)]
#[error("{msg}")]
pub struct CniError {
    code: CniErrorCode,
    msg: String,
    details: Option<String>,
}

impl CniError {
    /// Create a new CNI error
    pub fn new(code: CniErrorCode, msg: &str) -> Self {
        Self {
            code,
            msg: msg.to_string(),
            details: None,
        }
    }

    /// Add details to the error
    pub fn with_details(mut self, details: &str) -> Self {
        self.details = Some(details.to_string());
        self
    }

    /// Prefix the message with the orchestration step that failed,
    /// e.g. `create-veth: failed to create veth pair`
    pub fn tag(mut self, op: &str) -> Self {
        self.msg = format!("{}: {}", op, self.msg);
        self
    }

    /// Get the error code
    pub fn code(&self) -> CniErrorCode {
        self.code
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Get the error details
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }
}

// Convenience constructors for common errors

impl CniError {
    /// Create an IO error
    pub fn io_error(msg: &str) -> Self {
        Self::new(CniErrorCode::IoFailure, msg)
    }

    /// Create a decoding error
    pub fn decode_error(msg: &str) -> Self {
        Self::new(CniErrorCode::DecodingFailure, msg)
    }

    /// Create an invalid config error
    pub fn config_error(msg: &str) -> Self {
        Self::new(CniErrorCode::InvalidNetworkConfig, msg)
    }

    /// Create a bridge error
    pub fn bridge_error(msg: &str) -> Self {
        Self::new(CniErrorCode::BridgeFailure, msg)
    }

    /// Create a veth error
    pub fn veth_error(msg: &str) -> Self {
        Self::new(CniErrorCode::VethFailure, msg)
    }

    /// Create an IPAM error
    pub fn ipam_error(msg: &str) -> Self {
        Self::new(CniErrorCode::IpamFailure, msg)
    }

    /// Create a namespace error
    pub fn namespace_error(msg: &str) -> Self {
        Self::new(CniErrorCode::NamespaceFailure, msg)
    }

    /// Create a route error
    pub fn route_error(msg: &str) -> Self {
        Self::new(CniErrorCode::RouteFailure, msg)
    }
}
