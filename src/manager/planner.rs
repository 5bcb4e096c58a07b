//! Plan reconciliation.
//!
//! Rebuilds the Plan from `(config, current plan, local liveness)`. Pure
//! over its inputs apart from the random placement decisions, which come
//! from the caller's RNG so tests can seed them.

use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use super::election::rebuild_manager_states;
use crate::model::{AddressPool, Config, LoadBalancerConfig, Plan, ServiceConfig, Vm};

/// Errors that abort one reconciliation attempt. The offending revision is
/// not written; the next tick retries.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("address pool of manager '{manager}' is exhausted")]
    PoolExhausted { manager: String },
}

/// Everything one reconciliation reads.
#[derive(Clone, Copy)]
pub struct ReconcileCtx<'a> {
    pub config: &'a Config,
    pub plan: &'a Plan,
    pub self_name: &'a str,
    /// Tokens the local status table currently declares dead.
    pub dead: &'a HashSet<Uuid>,
}

/// Produce the next Plan revision, or `None` when nothing changed.
pub fn reconcile(ctx: &ReconcileCtx<'_>, rng: &mut impl Rng) -> Result<Option<Plan>, PlanError> {
    let ReconcileCtx {
        config,
        plan,
        self_name,
        dead,
    } = *ctx;

    let (manager_states, mut changed) =
        rebuild_manager_states(config, &plan.manager_states, self_name, dead, rng);
    let active: Vec<String> = manager_states
        .iter()
        .filter(|s| s.is_active)
        .map(|s| s.name.clone())
        .collect();

    // Only the owning manager sees its guests' heartbeats, so only it may
    // declare them dead. Dropped VMs are replanned below with fresh tokens.
    let mut survivors: Vec<Vm> = Vec::with_capacity(plan.vms.len());
    for vm in &plan.vms {
        if vm.manager() == self_name && dead.contains(&vm.token()) {
            changed = true;
        } else {
            survivors.push(vm.clone());
        }
    }

    // VMs of services that left the config disappear with them.
    let known: HashSet<&str> = config.services.iter().map(|s| s.name.as_str()).collect();
    if survivors.iter().any(|vm| !known.contains(vm.service())) {
        changed = true;
    }

    // Addresses stay claimed for the whole pass, dropped VMs included, so a
    // replacement never reuses an address freed in the same revision.
    let mut used = plan.addresses_in_use();

    let mut vms = Vec::new();
    for service in &config.services {
        let (workers, workers_changed) =
            plan_workers(service, &survivors, &active, config, &mut used, rng)?;
        changed |= workers_changed;

        let (lb, lb_changed) = plan_load_balancer(
            service,
            config.load_balancer_for(&service.name),
            &workers,
            &survivors,
            &active,
            rng,
        );
        changed |= lb_changed;

        vms.extend(workers);
        vms.extend(lb);
    }

    if !changed {
        return Ok(None);
    }
    Ok(Some(Plan {
        version: plan.version + 1,
        vms,
        manager_states,
    }))
}

/// Keep workers on active managers, then scale towards `replicas`.
fn plan_workers(
    service: &ServiceConfig,
    survivors: &[Vm],
    active: &[String],
    config: &Config,
    used: &mut BTreeSet<Ipv4Addr>,
    rng: &mut impl Rng,
) -> Result<(Vec<Vm>, bool), PlanError> {
    let mut changed = false;
    let mut workers: Vec<Vm> = Vec::new();
    for vm in survivors
        .iter()
        .filter(|vm| vm.is_worker() && vm.service() == service.name)
    {
        if active.iter().any(|name| name == vm.manager()) {
            workers.push(vm.clone());
        } else {
            changed = true;
        }
    }

    while workers.len() > service.replicas {
        workers.remove(rng.gen_range(0..workers.len()));
        changed = true;
    }
    while workers.len() < service.replicas {
        let Some(manager_name) = active.choose(rng) else {
            break;
        };
        let manager = config
            .manager(manager_name)
            .expect("active managers come from config");
        let address = allocate_address(&manager.address_pool, used).ok_or_else(|| {
            PlanError::PoolExhausted {
                manager: manager.name.clone(),
            }
        })?;
        workers.push(Vm::Worker {
            service: service.name.clone(),
            manager: manager.name.clone(),
            address,
            port: service.port,
            token: Uuid::new_v4(),
        });
        changed = true;
    }
    Ok((workers, changed))
}

/// First unused address in the pool, scanning ascending.
fn allocate_address(pool: &AddressPool, used: &mut BTreeSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    let address = pool.iter().find(|a| !used.contains(a))?;
    used.insert(address);
    Some(address)
}

/// Converge the 0-or-1 load balancer of one service.
///
/// A move to another host or address rebuilds the guest, so it gets a
/// fresh token; a pure upstream or port change is reconfigured in place
/// and keeps its token.
fn plan_load_balancer(
    service: &ServiceConfig,
    lb_config: Option<&LoadBalancerConfig>,
    workers: &[Vm],
    survivors: &[Vm],
    active: &[String],
    rng: &mut impl Rng,
) -> (Option<Vm>, bool) {
    let mut existing: Vec<&Vm> = survivors
        .iter()
        .filter(|vm| vm.is_load_balancer() && vm.service() == service.name)
        .collect();
    let mut changed = false;
    if existing.len() > 1 {
        warn!(
            service = %service.name,
            count = existing.len(),
            "more than one load balancer in stored plan; keeping the first"
        );
        existing.truncate(1);
        changed = true;
    }
    let existing = existing.into_iter().next();

    let Some(lb_config) = lb_config else {
        return (None, changed || existing.is_some());
    };

    let upstream: Vec<(Ipv4Addr, u16)> = workers.iter().map(|w| (w.address(), w.port())).collect();
    let upstream_set: BTreeSet<(Ipv4Addr, u16)> = upstream.iter().copied().collect();

    match existing {
        None => {
            let Some(manager) = active.choose(rng) else {
                warn!(service = %service.name, "no active manager to host the load balancer");
                return (None, changed);
            };
            let lb = Vm::LoadBalancer {
                service: service.name.clone(),
                manager: manager.clone(),
                address: lb_config.address,
                port: lb_config.port,
                token: Uuid::new_v4(),
                upstream,
            };
            (Some(lb), true)
        }
        Some(current) => {
            let manager = if active.iter().any(|name| name == current.manager()) {
                current.manager().to_string()
            } else {
                match active.choose(rng) {
                    Some(manager) => manager.clone(),
                    None => {
                        warn!(service = %service.name, "no active manager to host the load balancer");
                        return (None, true);
                    }
                }
            };

            let rehosted = manager != current.manager();
            let readdressed = lb_config.address != current.address();
            let retuned =
                lb_config.port != current.port() || upstream_set != current.upstream_set();
            if !rehosted && !readdressed && !retuned {
                return (Some(current.clone()), changed);
            }

            let token = if rehosted || readdressed {
                Uuid::new_v4()
            } else {
                current.token()
            };
            let lb = Vm::LoadBalancer {
                service: service.name.clone(),
                manager,
                address: lb_config.address,
                port: lb_config.port,
                token,
                upstream,
            };
            (Some(lb), true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GeneralSettings, ManagerConfig};
    use chrono::TimeDelta;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn manager(name: &str, octet: u8) -> ManagerConfig {
        ManagerConfig {
            name: name.to_string(),
            address: format!("192.168.1.{octet}").parse().unwrap(),
            port: 8000,
            token: Uuid::new_v4(),
            imgs_path: "/var/lib/wso/imgs".into(),
            address_pool: format!("10.0.{octet}.2-10.0.{octet}.10").parse().unwrap(),
        }
    }

    fn single_node_config() -> Config {
        Config {
            general: GeneralSettings {
                max_inactive: TimeDelta::seconds(10),
            },
            managers: vec![ManagerConfig {
                address_pool: "10.0.0.2-10.0.0.10".parse().unwrap(),
                ..manager("m1", 10)
            }],
            services: vec![ServiceConfig {
                name: "time".into(),
                image: "timesrv.qcow2".into(),
                port: 8080,
                replicas: 2,
            }],
            load_balancers: vec![],
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    fn run(config: &Config, plan: &Plan, dead: &HashSet<Uuid>) -> Option<Plan> {
        reconcile(
            &ReconcileCtx {
                config,
                plan,
                self_name: &config.managers[0].name,
                dead,
            },
            &mut rng(),
        )
        .unwrap()
    }

    #[test]
    fn single_node_empty_start() {
        let config = single_node_config();
        let plan = run(&config, &Plan::default(), &HashSet::new()).unwrap();

        assert_eq!(plan.version, 1);
        let addresses: Vec<Ipv4Addr> = plan.vms.iter().map(Vm::address).collect();
        assert_eq!(
            addresses,
            vec!["10.0.0.2".parse::<Ipv4Addr>().unwrap(), "10.0.0.3".parse().unwrap()]
        );
        assert!(plan.vms.iter().all(|vm| vm.is_worker() && vm.manager() == "m1"));

        let m1 = plan.manager_state("m1").unwrap();
        assert!(m1.is_primary);
        assert!(m1.is_active);
    }

    #[test]
    fn reconciliation_reaches_a_fixpoint() {
        let config = single_node_config();
        let v1 = run(&config, &Plan::default(), &HashSet::new()).unwrap();
        assert!(run(&config, &v1, &HashSet::new()).is_none());
    }

    #[test]
    fn adding_a_load_balancer_bumps_the_plan() {
        let mut config = single_node_config();
        let v1 = run(&config, &Plan::default(), &HashSet::new()).unwrap();

        config.load_balancers.push(LoadBalancerConfig {
            service: "time".into(),
            address: "10.0.0.100".parse().unwrap(),
            port: 80,
            image: "nginx.qcow2".into(),
        });
        let v2 = run(&config, &v1, &HashSet::new()).unwrap();

        assert_eq!(v2.version, 2);
        let lb = v2.load_balancers_for_service("time").next().unwrap();
        let expected: BTreeSet<(Ipv4Addr, u16)> = [
            ("10.0.0.2".parse().unwrap(), 8080),
            ("10.0.0.3".parse().unwrap(), 8080),
        ]
        .into();
        assert_eq!(lb.upstream_set(), expected);
        assert_eq!(lb.address(), "10.0.0.100".parse::<Ipv4Addr>().unwrap());

        assert!(run(&config, &v2, &HashSet::new()).is_none());
    }

    #[test]
    fn dead_worker_is_replaced_with_fresh_token_and_next_address() {
        let config = single_node_config();
        let v1 = run(&config, &Plan::default(), &HashSet::new()).unwrap();

        let doomed = v1
            .vms
            .iter()
            .find(|vm| vm.address() == "10.0.0.2".parse::<Ipv4Addr>().unwrap())
            .unwrap()
            .clone();
        let dead = HashSet::from([doomed.token()]);
        let v2 = run(&config, &v1, &dead).unwrap();

        assert_eq!(v2.version, 2);
        assert_eq!(v2.workers_for_service("time").count(), 2);
        assert!(v2.vms.iter().all(|vm| vm.token() != doomed.token()));
        let replacement = v2
            .vms
            .iter()
            .find(|vm| vm.address() != "10.0.0.3".parse::<Ipv4Addr>().unwrap())
            .unwrap();
        // The dead worker's address is still claimed in this revision.
        assert_eq!(replacement.address(), "10.0.0.4".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn scale_down_removes_workers() {
        let mut config = single_node_config();
        let v1 = run(&config, &Plan::default(), &HashSet::new()).unwrap();

        config.services[0].replicas = 1;
        let v2 = run(&config, &v1, &HashSet::new()).unwrap();
        assert_eq!(v2.workers_for_service("time").count(), 1);
        // The survivor kept its token.
        let survivor = v2.workers_for_service("time").next().unwrap();
        assert!(v1.vms.iter().any(|vm| vm.token() == survivor.token()));
    }

    #[test]
    fn inactive_manager_loses_its_vms() {
        let mut config = single_node_config();
        config.managers.push(manager("m2", 20));
        // With two managers a single vote is a quorum.
        assert_eq!(config.quorum(), 1);

        let v1 = run(&config, &Plan::default(), &HashSet::new()).unwrap();

        let dead = HashSet::from([config.managers[1].token]);
        let v2 = run(&config, &v1, &dead).unwrap();
        assert_eq!(v2.version, 2);
        assert!(!v2.manager_state("m2").unwrap().is_active);
        assert_eq!(v2.vms_for_manager("m2").count(), 0);
        assert_eq!(v2.workers_for_service("time").count(), 2);
    }

    #[test]
    fn lb_rehosting_mints_a_fresh_token() {
        let mut config = single_node_config();
        config.managers.push(manager("m2", 20));
        config.load_balancers.push(LoadBalancerConfig {
            service: "time".into(),
            address: "10.0.0.100".parse().unwrap(),
            port: 80,
            image: "nginx.qcow2".into(),
        });

        let v1 = run(&config, &Plan::default(), &HashSet::new()).unwrap();
        let lb = v1.load_balancers_for_service("time").next().unwrap().clone();

        // Kill whichever manager hosts the LB; the other must take over.
        let host_token = config.manager(lb.manager()).unwrap().token;
        let self_is_host = lb.manager() == "m1";
        let ctx_self = if self_is_host { "m2" } else { "m1" };
        let dead = HashSet::from([host_token]);
        let v2 = reconcile(
            &ReconcileCtx {
                config: &config,
                plan: &v1,
                self_name: ctx_self,
                dead: &dead,
            },
            &mut rng(),
        )
        .unwrap()
        .unwrap();

        let moved = v2.load_balancers_for_service("time").next().unwrap();
        assert_ne!(moved.manager(), lb.manager());
        assert_ne!(moved.token(), lb.token());
        assert_eq!(moved.address(), lb.address());
    }

    #[test]
    fn upstream_change_keeps_the_lb_token() {
        let mut config = single_node_config();
        config.load_balancers.push(LoadBalancerConfig {
            service: "time".into(),
            address: "10.0.0.100".parse().unwrap(),
            port: 80,
            image: "nginx.qcow2".into(),
        });
        let v1 = run(&config, &Plan::default(), &HashSet::new()).unwrap();
        let lb = v1.load_balancers_for_service("time").next().unwrap().clone();

        config.services[0].replicas = 3;
        let v2 = run(&config, &v1, &HashSet::new()).unwrap();
        let updated = v2.load_balancers_for_service("time").next().unwrap();
        assert_eq!(updated.token(), lb.token());
        assert_eq!(updated.upstream_set().len(), 3);
    }

    #[test]
    fn removing_the_lb_config_drops_the_vm() {
        let mut config = single_node_config();
        config.load_balancers.push(LoadBalancerConfig {
            service: "time".into(),
            address: "10.0.0.100".parse().unwrap(),
            port: 80,
            image: "nginx.qcow2".into(),
        });
        let v1 = run(&config, &Plan::default(), &HashSet::new()).unwrap();
        assert_eq!(v1.load_balancers_for_service("time").count(), 1);

        config.load_balancers.clear();
        let v2 = run(&config, &v1, &HashSet::new()).unwrap();
        assert_eq!(v2.load_balancers_for_service("time").count(), 0);
        assert_eq!(v2.workers_for_service("time").count(), 2);
    }

    #[test]
    fn pool_exhaustion_aborts_the_revision() {
        let mut config = single_node_config();
        config.managers[0].address_pool = "10.0.0.2-10.0.0.3".parse().unwrap();
        config.services[0].replicas = 5;

        let result = reconcile(
            &ReconcileCtx {
                config: &config,
                plan: &Plan::default(),
                self_name: "m1",
                dead: &HashSet::new(),
            },
            &mut rng(),
        );
        assert!(matches!(result, Err(PlanError::PoolExhausted { .. })));
    }

    #[test]
    fn removed_service_takes_its_vms_along() {
        let config = single_node_config();
        let v1 = run(&config, &Plan::default(), &HashSet::new()).unwrap();

        let mut emptied = config.clone();
        emptied.services.clear();
        let v2 = run(&emptied, &v1, &HashSet::new()).unwrap();
        assert!(v2.vms.is_empty());
        assert_eq!(v2.version, 2);
    }
}
