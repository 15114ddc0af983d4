//! AtomicNI CNI plugin
//!
//! Attaches a container to a user-defined Layer-2 bridge network and
//! assigns it an IPv4 address from a locally managed pool. Implements CNI
//! Spec 1.1.0; DEL and CHECK are placeholders beyond address release.

mod config;
mod error;
mod ipam;
mod names;
mod netns;
mod netops;
mod plugin;
mod result;
mod store;

use std::env;
use std::io::{self, Read};

use tokio_util::sync::CancellationToken;

use error::{CniError, CniErrorCode};
use plugin::{AddArgs, DelArgs, Plugin};
use result::VersionResult;

/// Maximum size of network config input (1 MB should be more than enough)
const MAX_INPUT_SIZE: u64 = 1024 * 1024;

/// CNI Spec version supported by this plugin
const CNI_VERSION: &str = "1.1.0";

/// Supported CNI versions
const SUPPORTED_VERSIONS: &[&str] = &["1.0.0", "1.1.0"];

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        // Error document goes to stdout per the CNI conventions
        let error_output = serde_json::json!({
            "cniVersion": CNI_VERSION,
            "code": e.code() as u32,
            "msg": e.message(),
            "details": e.details()
        });
        println!(
            "{}",
            serde_json::to_string(&error_output).unwrap_or_else(|_| {
                format!(
                    r#"{{"cniVersion":"{}","code":{},"msg":"{}"}}"#,
                    CNI_VERSION,
                    e.code() as u32,
                    e.message()
                )
            })
        );
        std::process::exit(1);
    }
}

fn run() -> Result<(), CniError> {
    let command = env::var("CNI_COMMAND").map_err(|_| {
        CniError::new(
            CniErrorCode::InvalidEnvironmentVariables,
            "CNI_COMMAND not set",
        )
    })?;

    // Read network config from stdin (with size limit to prevent OOM)
    let mut input = String::new();
    io::stdin()
        .take(MAX_INPUT_SIZE)
        .read_to_string(&mut input)
        .map_err(|e| {
            CniError::io_error("failed to read stdin").with_details(&e.to_string())
        })?;

    match command.as_str() {
        "ADD" => cmd_add(&input),
        "DEL" => cmd_del(&input),
        "CHECK" => cmd_check(&input),
        "VERSION" => cmd_version(),
        _ => {
            // Truncate command for safety in error message (avoid log injection)
            let safe_command: String = command
                .chars()
                .take(32)
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                .collect();
            Err(CniError::new(
                CniErrorCode::InvalidEnvironmentVariables,
                &format!("unknown CNI_COMMAND: {}", safe_command),
            ))
        }
    }
}

fn require_env(name: &str) -> Result<String, CniError> {
    env::var(name).map_err(|_| {
        CniError::new(
            CniErrorCode::InvalidEnvironmentVariables,
            &format!("{} not set", name),
        )
    })
}

/// Handle ADD: attach the container and print the CNI result
fn cmd_add(input: &str) -> Result<(), CniError> {
    let args = AddArgs {
        container_id: require_env("CNI_CONTAINERID")?,
        netns_path: require_env("CNI_NETNS")?,
        ifname: require_env("CNI_IFNAME")?,
        stdin_data: input.as_bytes().to_vec(),
    };

    let plugin = Plugin::new();
    let cancel = CancellationToken::new();
    let result = plugin.add(&cancel, &args)?;

    println!(
        "{}",
        serde_json::to_string(&result).map_err(|e| {
            CniError::io_error("failed to serialize result").with_details(&e.to_string())
        })?
    );
    Ok(())
}

/// Handle DEL: release the container's address reservation.
/// Outputs nothing on success and must be idempotent.
fn cmd_del(input: &str) -> Result<(), CniError> {
    let args = DelArgs {
        container_id: require_env("CNI_CONTAINERID")?,
        stdin_data: input.as_bytes().to_vec(),
    };

    let plugin = Plugin::new();
    let cancel = CancellationToken::new();
    plugin.del(&cancel, &args)
}

/// Handle CHECK: validate environment and config only (placeholder)
fn cmd_check(input: &str) -> Result<(), CniError> {
    let container_id = require_env("CNI_CONTAINERID")?;
    require_env("CNI_NETNS")?;
    let ifname = require_env("CNI_IFNAME")?;

    config::parse(input.as_bytes())?;

    log::debug!(
        "CHECK is a placeholder: container={}, ifname={}",
        container_id,
        ifname
    );
    Ok(())
}

/// Handle VERSION: report supported CNI versions
fn cmd_version() -> Result<(), CniError> {
    let result = VersionResult {
        cni_version: CNI_VERSION.to_string(),
        supported_versions: SUPPORTED_VERSIONS.iter().map(|s| s.to_string()).collect(),
    };

    println!(
        "{}",
        serde_json::to_string(&result).map_err(|e| {
            CniError::io_error("failed to serialize version").with_details(&e.to_string())
        })?
    );
    Ok(())
}
