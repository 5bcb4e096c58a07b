//! Plan — where every VM should live and run.
//!
//! A single `Plan` lives in the store under `plans/global`. Reconciliation
//! rebuilds it from config plus observed health and writes it back with a
//! compare-and-swap on `version`; concurrent writers race and exactly one
//! wins.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The global plan singleton.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Monotonically increasing; the CAS key for writes.
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub vms: Vec<Vm>,
    #[serde(default)]
    pub manager_states: Vec<ManagerState>,
}

impl Plan {
    pub fn workers_for_service<'a>(&'a self, service: &'a str) -> impl Iterator<Item = &'a Vm> {
        self.vms
            .iter()
            .filter(move |vm| vm.is_worker() && vm.service() == service)
    }

    pub fn load_balancers_for_service<'a>(
        &'a self,
        service: &'a str,
    ) -> impl Iterator<Item = &'a Vm> {
        self.vms
            .iter()
            .filter(move |vm| vm.is_load_balancer() && vm.service() == service)
    }

    pub fn vms_for_manager<'a>(&'a self, manager: &'a str) -> impl Iterator<Item = &'a Vm> {
        self.vms.iter().filter(move |vm| vm.manager() == manager)
    }

    pub fn manager_state(&self, name: &str) -> Option<&ManagerState> {
        self.manager_states.iter().find(|s| s.name == name)
    }

    /// Every address currently claimed by any VM in the plan.
    pub fn addresses_in_use(&self) -> BTreeSet<Ipv4Addr> {
        self.vms.iter().map(|vm| vm.address()).collect()
    }
}

/// Discriminates the two VM kinds; doubles as the name segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmKind {
    Worker,
    LoadBalancer,
}

impl VmKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VmKind::Worker => "wrk",
            VmKind::LoadBalancer => "lb",
        }
    }
}

/// A planned guest, a closed sum over its two kinds.
///
/// The `type` tag drives both the stored form and per-kind reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Vm {
    #[serde(rename = "wrk")]
    Worker {
        service: String,
        manager: String,
        address: Ipv4Addr,
        port: u16,
        token: Uuid,
    },
    #[serde(rename = "lb")]
    LoadBalancer {
        service: String,
        manager: String,
        address: Ipv4Addr,
        port: u16,
        token: Uuid,
        /// `(address, port)` of every worker this LB fronts; compared as a set.
        upstream: Vec<(Ipv4Addr, u16)>,
    },
}

impl Vm {
    pub fn kind(&self) -> VmKind {
        match self {
            Vm::Worker { .. } => VmKind::Worker,
            Vm::LoadBalancer { .. } => VmKind::LoadBalancer,
        }
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, Vm::Worker { .. })
    }

    pub fn is_load_balancer(&self) -> bool {
        matches!(self, Vm::LoadBalancer { .. })
    }

    pub fn service(&self) -> &str {
        match self {
            Vm::Worker { service, .. } | Vm::LoadBalancer { service, .. } => service,
        }
    }

    pub fn manager(&self) -> &str {
        match self {
            Vm::Worker { manager, .. } | Vm::LoadBalancer { manager, .. } => manager,
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        match self {
            Vm::Worker { address, .. } | Vm::LoadBalancer { address, .. } => *address,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Vm::Worker { port, .. } | Vm::LoadBalancer { port, .. } => *port,
        }
    }

    pub fn token(&self) -> Uuid {
        match self {
            Vm::Worker { token, .. } | Vm::LoadBalancer { token, .. } => *token,
        }
    }

    /// The stable hypervisor identifier: `wso-<manager>-<type>-<service>-<token>`.
    pub fn name(&self) -> String {
        format!(
            "wso-{}-{}-{}-{}",
            self.manager(),
            self.kind().as_str(),
            self.service(),
            self.token()
        )
    }

    pub fn host(&self) -> String {
        format!("{}:{}", self.address(), self.port())
    }

    /// Upstream pairs as a set; order in the stored list is irrelevant.
    pub fn upstream_set(&self) -> BTreeSet<(Ipv4Addr, u16)> {
        match self {
            Vm::Worker { .. } => BTreeSet::new(),
            Vm::LoadBalancer { upstream, .. } => upstream.iter().copied().collect(),
        }
    }
}

/// The parsed parts of a domain name minted by [`Vm::name`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmName {
    pub manager: String,
    pub kind: VmKind,
    pub service: String,
    pub token: Uuid,
}

static VM_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^wso-(?P<manager>.+)-(?P<type>wrk|lb)-(?P<service>.+)-(?P<uuid>[0-9a-f-]{36})$")
        .expect("VM name regex is valid")
});

/// Parse a hypervisor domain name; `None` for domains this system does not own.
pub fn parse_vm_name(name: &str) -> Option<VmName> {
    let captures = VM_NAME_REGEX.captures(name)?;
    let kind = match &captures["type"] {
        "wrk" => VmKind::Worker,
        _ => VmKind::LoadBalancer,
    };
    let token = captures["uuid"].parse().ok()?;
    Some(VmName {
        manager: captures["manager"].to_string(),
        kind,
        service: captures["service"].to_string(),
        token,
    })
}

/// One manager's standing as recorded in the plan.
///
/// `is_dead_for` is the set of managers that currently consider this one
/// dead; each peer maintains only its own edge. Entries are created when a
/// manager first appears in config and never deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerState {
    pub name: String,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_dead_for: BTreeSet<String>,
}

impl ManagerState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Dead by majority vote: at least `quorum` peers report it dead.
    pub fn is_dead(&self, quorum: usize) -> bool {
        self.is_dead_for.len() >= quorum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(manager: &str, service: &str, address: &str, token: Uuid) -> Vm {
        Vm::Worker {
            service: service.into(),
            manager: manager.into(),
            address: address.parse().unwrap(),
            port: 8080,
            token,
        }
    }

    #[test]
    fn vm_name_round_trips() {
        let token = Uuid::new_v4();
        let vm = worker("m1", "time", "10.0.0.2", token);
        let name = vm.name();
        assert_eq!(name, format!("wso-m1-wrk-time-{token}"));

        let parsed = parse_vm_name(&name).unwrap();
        assert_eq!(parsed.manager, "m1");
        assert_eq!(parsed.kind, VmKind::Worker);
        assert_eq!(parsed.service, "time");
        assert_eq!(parsed.token, token);
    }

    #[test]
    fn foreign_domains_are_ignored() {
        assert!(parse_vm_name("ubuntu-22.04").is_none());
        assert!(parse_vm_name("wso-m1-wrk-time-not-a-uuid").is_none());
        assert!(parse_vm_name("wso-m1-gw-time-0b8e8f2e-7a30-4a2b-9d62-8f2c7e2f5a11").is_none());
    }

    #[test]
    fn serde_tag_discriminates_kinds() {
        let token = Uuid::new_v4();
        let lb = Vm::LoadBalancer {
            service: "time".into(),
            manager: "m1".into(),
            address: "10.0.0.100".parse().unwrap(),
            port: 80,
            token,
            upstream: vec![("10.0.0.2".parse().unwrap(), 8080)],
        };
        let json = serde_json::to_value(&lb).unwrap();
        assert_eq!(json["type"], "lb");
        assert_eq!(json["upstream"][0][1], 8080);

        let back: Vm = serde_json::from_value(json).unwrap();
        assert_eq!(back, lb);
        assert!(back.is_load_balancer());
    }

    #[test]
    fn upstream_compares_as_set() {
        let a = Vm::LoadBalancer {
            service: "time".into(),
            manager: "m1".into(),
            address: "10.0.0.100".parse().unwrap(),
            port: 80,
            token: Uuid::new_v4(),
            upstream: vec![
                ("10.0.0.3".parse().unwrap(), 8080),
                ("10.0.0.2".parse().unwrap(), 8080),
            ],
        };
        let expected: BTreeSet<(Ipv4Addr, u16)> = [
            ("10.0.0.2".parse().unwrap(), 8080),
            ("10.0.0.3".parse().unwrap(), 8080),
        ]
        .into();
        assert_eq!(a.upstream_set(), expected);
    }

    #[test]
    fn plan_accessors_filter_by_kind_and_owner() {
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let plan = Plan {
            version: 3,
            vms: vec![
                worker("m1", "time", "10.0.0.2", t1),
                worker("m2", "time", "10.0.1.2", t2),
                Vm::LoadBalancer {
                    service: "time".into(),
                    manager: "m1".into(),
                    address: "10.0.0.100".parse().unwrap(),
                    port: 80,
                    token: Uuid::new_v4(),
                    upstream: vec![],
                },
            ],
            manager_states: vec![],
        };
        assert_eq!(plan.workers_for_service("time").count(), 2);
        assert_eq!(plan.load_balancers_for_service("time").count(), 1);
        assert_eq!(plan.vms_for_manager("m1").count(), 2);
        assert_eq!(plan.addresses_in_use().len(), 3);
    }

    #[test]
    fn empty_plan_deserializes_from_empty_document() {
        let plan: Plan = serde_json::from_str("{}").unwrap();
        assert_eq!(plan.version, 0);
        assert!(plan.vms.is_empty());
        assert!(plan.manager_states.is_empty());
    }

    #[test]
    fn dead_by_quorum() {
        let mut state = ManagerState::new("m3");
        assert!(!state.is_dead(2));
        state.is_dead_for.insert("m1".into());
        assert!(!state.is_dead(2));
        state.is_dead_for.insert("m2".into());
        assert!(state.is_dead(2));
    }
}
