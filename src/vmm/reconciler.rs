//! Diff the plan's view of this host against the domains actually present
//! and converge: create what is missing, delete what is extra, and
//! reconfigure load balancers in place.
//!
//! Actions fan out concurrently and join; one failing VM never blocks the
//! others, and the plan is not rolled back on failure. The next plan event
//! or correction tick retries whatever is still off.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::driver::{Hypervisor, VmmError};
use super::provision::Provisioner;
use super::xml;
use crate::model::{parse_vm_name, Config, ManagerConfig, Plan, Vm};

const BOOT_TIMEOUT: Duration = Duration::from_secs(120);
const BOOT_POLL: Duration = Duration::from_secs(5);

/// What one convergence pass decided to do.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VmDiff {
    pub create: Vec<Vm>,
    pub delete: Vec<String>,
    pub update: Vec<Vm>,
}

/// Pure diff: planned VMs for this host vs. domains present on it.
///
/// A load balancer whose planned fields differ from the last applied copy
/// (or that was never applied by this process) is reconfigured in place;
/// its name and token are unchanged by construction, otherwise it would
/// appear as a create/delete pair instead.
pub fn diff_local(
    desired: &[Vm],
    present: &BTreeSet<String>,
    last_applied: &HashMap<String, Vm>,
) -> VmDiff {
    let mut diff = VmDiff::default();
    let mut desired_names = BTreeSet::new();
    for vm in desired {
        let name = vm.name();
        if !present.contains(&name) {
            diff.create.push(vm.clone());
        } else if vm.is_load_balancer() && last_applied.get(&name) != Some(vm) {
            diff.update.push(vm.clone());
        }
        desired_names.insert(name);
    }
    for name in present {
        if !desired_names.contains(name) {
            diff.delete.push(name.clone());
        }
    }
    diff
}

/// Tokens whose guests exist after a convergence pass.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Created by this pass.
    pub created: Vec<Uuid>,
    /// Already present before this pass.
    pub present: Vec<Uuid>,
}

enum Outcome {
    Created(Vm),
    Deleted(String),
    Updated(Vm),
}

/// Converges this host's domains towards the plan.
pub struct LocalReconciler {
    manager: ManagerConfig,
    hypervisor: Arc<dyn Hypervisor>,
    provisioner: Arc<dyn Provisioner>,
    /// Last VM definition applied per domain name; drives LB updates.
    last_applied: Mutex<HashMap<String, Vm>>,
    /// Guards per-name idempotence across overlapping triggers.
    in_flight: DashMap<String, ()>,
    /// Serializes whole passes; a pass can take minutes.
    apply_lock: Mutex<()>,
}

impl LocalReconciler {
    pub fn new(
        manager: ManagerConfig,
        hypervisor: Arc<dyn Hypervisor>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            manager,
            hypervisor,
            provisioner,
            last_applied: Mutex::new(HashMap::new()),
            in_flight: DashMap::new(),
            apply_lock: Mutex::new(()),
        }
    }

    /// Domains on this host that belong to this manager.
    pub async fn local_vm_names(&self) -> Result<BTreeSet<String>, VmmError> {
        Ok(self
            .hypervisor
            .list_domains()
            .await?
            .into_iter()
            .filter(|name| {
                parse_vm_name(name).is_some_and(|parsed| parsed.manager == self.manager.name)
            })
            .collect())
    }

    /// One convergence pass. Every action failure is logged with its VM
    /// name and the rest continue.
    pub async fn apply(&self, config: &Config, plan: &Plan) -> ApplyReport {
        let _pass = self.apply_lock.lock().await;

        let desired: Vec<Vm> = plan.vms_for_manager(&self.manager.name).cloned().collect();
        let present = match self.local_vm_names().await {
            Ok(present) => present,
            Err(error) => {
                warn!(%error, "could not list local domains; skipping convergence pass");
                return ApplyReport::default();
            }
        };
        let diff = {
            let last_applied = self.last_applied.lock().await;
            diff_local(&desired, &present, &last_applied)
        };
        if diff == VmDiff::default() {
            return ApplyReport {
                created: vec![],
                present: tokens_of(&present),
            };
        }
        info!(
            create = diff.create.len(),
            delete = diff.delete.len(),
            update = diff.update.len(),
            "converging local domains"
        );

        let mut actions: Vec<BoxFuture<'_, Option<Outcome>>> = Vec::new();
        for vm in diff.create {
            actions.push(
                async move {
                    let name = vm.name();
                    match self.create_vm(config, &vm).await {
                        Ok(()) => Some(Outcome::Created(vm)),
                        Err(error) => {
                            warn!(vm = %name, %error, "failed to create guest");
                            None
                        }
                    }
                }
                .boxed(),
            );
        }
        for name in diff.delete {
            actions.push(
                async move {
                    match self.delete_vm(&name).await {
                        Ok(()) => Some(Outcome::Deleted(name)),
                        Err(error) => {
                            warn!(vm = %name, %error, "failed to delete guest");
                            None
                        }
                    }
                }
                .boxed(),
            );
        }
        for vm in diff.update {
            actions.push(
                async move {
                    let name = vm.name();
                    match self.update_load_balancer(&vm).await {
                        Ok(()) => Some(Outcome::Updated(vm)),
                        Err(error) => {
                            warn!(vm = %name, %error, "failed to reconfigure load balancer");
                            None
                        }
                    }
                }
                .boxed(),
            );
        }

        let outcomes = join_all(actions).await;

        let mut report = ApplyReport {
            created: vec![],
            present: tokens_of(&present),
        };
        let mut last_applied = self.last_applied.lock().await;
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                Outcome::Created(vm) => {
                    report.created.push(vm.token());
                    last_applied.insert(vm.name(), vm);
                }
                Outcome::Updated(vm) => {
                    last_applied.insert(vm.name(), vm);
                }
                Outcome::Deleted(name) => {
                    last_applied.remove(&name);
                }
            }
        }
        report
    }

    /// Clone the base image, define and start the domain, wait for the
    /// agent, re-IP the guest to its planned address, then run its
    /// per-kind bring-up.
    pub async fn create_vm(&self, config: &Config, vm: &Vm) -> Result<(), VmmError> {
        let name = vm.name();
        if self.in_flight.insert(name.clone(), ()).is_some() {
            debug!(vm = %name, "creation already in progress");
            return Ok(());
        }
        let result = self.create_vm_inner(config, vm, &name).await;
        self.in_flight.remove(&name);
        result
    }

    async fn create_vm_inner(&self, config: &Config, vm: &Vm, name: &str) -> Result<(), VmmError> {
        let image = match vm {
            Vm::Worker { .. } => config.service(vm.service()).map(|s| s.image.clone()),
            Vm::LoadBalancer { .. } => config
                .load_balancer_for(vm.service())
                .map(|lb| lb.image.clone()),
        }
        .ok_or_else(|| VmmError::UnknownImage(vm.service().to_string()))?;

        let base = format!("{}/{}", self.manager.imgs_path, image);
        let disk = format!("{}/{}.qcow2", self.manager.imgs_path, name);
        tokio::fs::copy(&base, &disk).await?;

        self.hypervisor
            .create_domain(name, &xml::domain_xml(&self.manager.imgs_path, name))
            .await?;
        self.wait_until_fully_booted(name).await?;

        let current = self.discover_address(name).await?;
        self.provisioner.setup_network(current, vm.address()).await?;
        self.provisioner.wait_reachable(vm.address()).await?;

        match vm {
            Vm::Worker { .. } => {
                self.provisioner.setup_worker(vm, &self.manager.host()).await?;
            }
            Vm::LoadBalancer { upstream, .. } => {
                self.provisioner.setup_load_balancer(vm, upstream).await?;
            }
        }
        info!(vm = %name, address = %vm.address(), "guest created and provisioned");
        Ok(())
    }

    /// Destroy the domain if it runs, then drop its disk.
    pub async fn delete_vm(&self, name: &str) -> Result<(), VmmError> {
        if self.in_flight.insert(name.to_string(), ()).is_some() {
            debug!(vm = %name, "deletion already in progress");
            return Ok(());
        }
        let result = self.delete_vm_inner(name).await;
        self.in_flight.remove(name);
        result
    }

    async fn delete_vm_inner(&self, name: &str) -> Result<(), VmmError> {
        if self.hypervisor.is_active(name).await? {
            self.hypervisor.destroy_domain(name).await?;
        }
        let disk = format!("{}/{}.qcow2", self.manager.imgs_path, name);
        match tokio::fs::remove_file(&disk).await {
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            other => other?,
        }
        info!(vm = %name, "guest deleted");
        Ok(())
    }

    /// Re-render the upstream configuration and re-run only the LB setup
    /// step; the guest keeps running.
    async fn update_load_balancer(&self, vm: &Vm) -> Result<(), VmmError> {
        let Vm::LoadBalancer { upstream, .. } = vm else {
            return Ok(());
        };
        self.provisioner.setup_load_balancer(vm, upstream).await?;
        info!(vm = %vm.name(), "load balancer reconfigured");
        Ok(())
    }

    /// The guest's current agent-reported IPv4 address, preferring `eth0`.
    pub async fn discover_address(&self, name: &str) -> Result<Ipv4Addr, VmmError> {
        let interfaces = self.hypervisor.interface_addresses(name).await?;
        if let Some(address) = interfaces.get("eth0").and_then(|a| a.first()) {
            return Ok(*address);
        }
        interfaces
            .iter()
            .filter(|(iface, _)| iface.as_str() != "lo")
            .flat_map(|(_, addresses)| addresses)
            .next()
            .copied()
            .ok_or_else(|| VmmError::NoAddress(name.to_string()))
    }

    async fn wait_until_fully_booted(&self, name: &str) -> Result<(), VmmError> {
        let deadline = Instant::now() + BOOT_TIMEOUT;
        loop {
            if self.hypervisor.guest_ping(name).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(VmmError::BootTimeout(name.to_string()));
            }
            tokio::time::sleep(BOOT_POLL).await;
        }
    }
}

fn tokens_of(names: &BTreeSet<String>) -> Vec<Uuid> {
    names
        .iter()
        .filter_map(|name| parse_vm_name(name).map(|parsed| parsed.token))
        .collect()
}
