//! Provisioning seam and its ansible backend.
//!
//! Guests come up with a DHCP address; provisioning re-IPs them to their
//! planned address and runs the per-kind bring-up playbook. Workers learn
//! their token and their manager's address so their heart can find home.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::info;

use super::driver::{run_checked, VmmError};
use super::xml;
use crate::model::Vm;

const REACHABLE_TIMEOUT: Duration = Duration::from_secs(20);
const REACHABLE_POLL: Duration = Duration::from_secs(3);

/// The provisioning steps the local reconciler consumes.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Re-IP a guest from its DHCP address to its planned address.
    async fn setup_network(&self, current: Ipv4Addr, target: Ipv4Addr) -> Result<(), VmmError>;

    /// Wait until an address answers pings.
    async fn wait_reachable(&self, address: Ipv4Addr) -> Result<(), VmmError>;

    /// Bring up a worker's service.
    async fn setup_worker(&self, vm: &Vm, manager_host: &str) -> Result<(), VmmError>;

    /// Render and apply a load balancer's upstream configuration.
    async fn setup_load_balancer(
        &self,
        vm: &Vm,
        upstream: &[(Ipv4Addr, u16)],
    ) -> Result<(), VmmError>;
}

/// Playbook-based provisioning; playbooks live next to the image
/// directory under `../ansible/<step>/playbook.yaml`.
pub struct AnsibleProvisioner {
    ansible_path: PathBuf,
}

impl AnsibleProvisioner {
    pub fn new(imgs_path: &str) -> Self {
        Self {
            ansible_path: Path::new(imgs_path).join("..").join("ansible"),
        }
    }

    fn playbook(&self, step: &str, target: Ipv4Addr, extra_vars: &str) -> Command {
        let mut command = Command::new("ansible-playbook");
        command
            .arg("-i")
            .arg(format!("{target},"))
            .arg(self.ansible_path.join(step).join("playbook.yaml"))
            .env("ANSIBLE_HOST_KEY_CHECKING", "False");
        if !extra_vars.is_empty() {
            command.arg("-e").arg(extra_vars);
        }
        command
    }
}

#[async_trait]
impl Provisioner for AnsibleProvisioner {
    async fn setup_network(&self, current: Ipv4Addr, target: Ipv4Addr) -> Result<(), VmmError> {
        run_checked(&mut self.playbook(
            "setup_network",
            current,
            &format!("curr_ip={current} new_ip={target}"),
        ))
        .await
        .map(|_| ())
    }

    async fn wait_reachable(&self, address: Ipv4Addr) -> Result<(), VmmError> {
        let deadline = Instant::now() + REACHABLE_TIMEOUT;
        loop {
            let mut ping = Command::new("ping");
            ping.args(["-c", "1", "-W", "1"]).arg(address.to_string());
            if run_checked(&mut ping).await.is_ok() {
                info!("{address} is reachable");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(VmmError::Unreachable(address));
            }
            tokio::time::sleep(REACHABLE_POLL).await;
        }
    }

    async fn setup_worker(&self, vm: &Vm, manager_host: &str) -> Result<(), VmmError> {
        run_checked(&mut self.playbook(
            &format!("run_{}", vm.service()),
            vm.address(),
            &format!("manager_address={} token={}", manager_host, vm.token()),
        ))
        .await
        .map(|_| ())
    }

    async fn setup_load_balancer(
        &self,
        vm: &Vm,
        upstream: &[(Ipv4Addr, u16)],
    ) -> Result<(), VmmError> {
        let conf = xml::nginx_conf(vm.port(), upstream);
        let conf_path = self.ansible_path.join("setup_nginx").join("nginx.conf");
        tokio::fs::write(&conf_path, conf).await?;
        run_checked(&mut self.playbook("setup_nginx", vm.address(), "")).await.map(|_| ())
    }
}
