//! Hypervisor seam and its `virsh` backend.
//!
//! The trait mirrors the handful of libvirt calls the reconciler needs.
//! The shipped backend shells out to `virsh`, which keeps the blocking
//! libvirt client out of the event loop entirely.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VmmError {
    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("domain '{0}' reported no usable address")]
    NoAddress(String),

    #[error("timed out waiting for '{0}' to boot")]
    BootTimeout(String),

    #[error("timed out waiting for {0} to become reachable")]
    Unreachable(Ipv4Addr),

    #[error("no image for service '{0}' in the current configuration")]
    UnknownImage(String),
}

/// The hypervisor operations the local reconciler consumes.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Names of all domains, running or not.
    async fn list_domains(&self) -> Result<Vec<String>, VmmError>;

    /// Define and start a transient domain from its XML.
    async fn create_domain(&self, name: &str, xml: &str) -> Result<(), VmmError>;

    async fn destroy_domain(&self, name: &str) -> Result<(), VmmError>;

    async fn is_active(&self, name: &str) -> Result<bool, VmmError>;

    /// Whether the guest agent answers `guest-ping` yet.
    async fn guest_ping(&self, name: &str) -> Result<bool, VmmError>;

    /// Agent-reported addresses, keyed by interface name.
    async fn interface_addresses(
        &self,
        name: &str,
    ) -> Result<HashMap<String, Vec<Ipv4Addr>>, VmmError>;
}

/// Run a subprocess to completion, failing on a non-zero exit.
pub(crate) async fn run_checked(command: &mut Command) -> Result<String, VmmError> {
    let rendered = format!("{:?}", command.as_std());
    debug!(command = %rendered, "running");
    let output = command.output().await?;
    if !output.status.success() {
        return Err(VmmError::CommandFailed {
            command: rendered,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `virsh`-backed hypervisor access.
pub struct VirshHypervisor {
    connect_uri: String,
}

impl VirshHypervisor {
    pub fn new(connect_uri: impl Into<String>) -> Self {
        Self {
            connect_uri: connect_uri.into(),
        }
    }

    fn virsh(&self) -> Command {
        let mut command = Command::new("virsh");
        command.arg("-c").arg(&self.connect_uri);
        command
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn list_domains(&self) -> Result<Vec<String>, VmmError> {
        let stdout = run_checked(self.virsh().args(["--quiet", "list", "--all", "--name"])).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn create_domain(&self, name: &str, xml: &str) -> Result<(), VmmError> {
        let path = std::env::temp_dir().join(format!("wsomgr-{name}.xml"));
        tokio::fs::write(&path, xml).await?;
        let result = run_checked(self.virsh().arg("create").arg(&path)).await;
        let _ = tokio::fs::remove_file(&path).await;
        result.map(|_| ())
    }

    async fn destroy_domain(&self, name: &str) -> Result<(), VmmError> {
        run_checked(self.virsh().args(["destroy", name])).await.map(|_| ())
    }

    async fn is_active(&self, name: &str) -> Result<bool, VmmError> {
        // A domain virsh does not know about is not active.
        match run_checked(self.virsh().args(["domstate", name])).await {
            Ok(stdout) => Ok(stdout.trim() == "running"),
            Err(VmmError::CommandFailed { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn guest_ping(&self, name: &str) -> Result<bool, VmmError> {
        let result = run_checked(self.virsh().args([
            "qemu-agent-command",
            name,
            r#"{"execute":"guest-ping"}"#,
        ]))
        .await;
        match result {
            Ok(stdout) => Ok(stdout.contains("return")),
            Err(VmmError::CommandFailed { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn interface_addresses(
        &self,
        name: &str,
    ) -> Result<HashMap<String, Vec<Ipv4Addr>>, VmmError> {
        let stdout =
            run_checked(self.virsh().args(["-q", "domifaddr", name, "--source", "agent"])).await?;
        Ok(parse_domifaddr(&stdout))
    }
}

/// Parse `virsh domifaddr` output: one row per address, continuation rows
/// carry `-` in the interface column.
fn parse_domifaddr(stdout: &str) -> HashMap<String, Vec<Ipv4Addr>> {
    let mut addresses: HashMap<String, Vec<Ipv4Addr>> = HashMap::new();
    let mut current = String::new();
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [iface, _mac, protocol, address] = fields[..] else {
            continue;
        };
        if iface != "-" {
            current = iface.to_string();
        }
        if protocol != "ipv4" || current.is_empty() {
            continue;
        }
        let Some(address) = address.split('/').next().and_then(|a| a.parse().ok()) else {
            continue;
        };
        addresses.entry(current.clone()).or_default().push(address);
    }
    addresses
}
