//! Randomized invariants of the reconciler, driven to a fixpoint.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::net::Ipv4Addr;

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use rand::rngs::StdRng;
use rand::SeedableRng;
use uuid::Uuid;
use wsomgr::manager::{reconcile, ReconcileCtx};
use wsomgr::model::{
    AddressPool, Config, GeneralSettings, LoadBalancerConfig, ManagerConfig, ManagerState, Plan,
    ServiceConfig,
};

fn build_config(n_managers: usize, replicas: &[usize], lb_flags: &[bool]) -> Config {
    let managers = (0..n_managers)
        .map(|i| ManagerConfig {
            name: format!("m{}", i + 1),
            address: format!("192.168.1.{}", 10 + i).parse().unwrap(),
            port: 8000,
            token: Uuid::new_v4(),
            imgs_path: "/var/lib/wso/imgs".into(),
            address_pool: format!("10.0.{i}.2-10.0.{i}.40")
                .parse::<AddressPool>()
                .unwrap(),
        })
        .collect();
    let services = replicas
        .iter()
        .enumerate()
        .map(|(i, &replicas)| ServiceConfig {
            name: format!("svc{i}"),
            image: format!("svc{i}.qcow2"),
            port: 8080 + i as u16,
            replicas,
        })
        .collect();
    let load_balancers = lb_flags
        .iter()
        .enumerate()
        .filter(|(_, &flag)| flag)
        .map(|(i, _)| LoadBalancerConfig {
            service: format!("svc{i}"),
            address: format!("10.255.0.{}", i + 1).parse().unwrap(),
            port: 80,
            image: "nginx.qcow2".into(),
        })
        .collect();
    Config {
        general: GeneralSettings {
            max_inactive: chrono::TimeDelta::seconds(10),
        },
        managers,
        services,
        load_balancers,
    }
}

fn arb_config() -> impl Strategy<Value = Config> {
    (1usize..=4).prop_flat_map(|n_managers| {
        (0usize..=3).prop_flat_map(move |n_services| {
            (
                proptest::collection::vec(0usize..=5, n_services),
                proptest::collection::vec(any::<bool>(), n_services),
            )
                .prop_map(move |(replicas, lb_flags)| {
                    build_config(n_managers, &replicas, &lb_flags)
                })
        })
    })
}

/// Re-run reconciliation (as the first manager) until it reports no
/// change, asserting version monotonicity along the way.
fn converge(
    config: &Config,
    mut plan: Plan,
    dead: &HashSet<Uuid>,
    rng: &mut StdRng,
) -> Result<Plan, TestCaseError> {
    for _ in 0..8 {
        let ctx = ReconcileCtx {
            config,
            plan: &plan,
            self_name: &config.managers[0].name,
            dead,
        };
        match reconcile(&ctx, rng).unwrap() {
            Some(next) => {
                prop_assert_eq!(next.version, plan.version + 1);
                plan = next;
            }
            None => return Ok(plan),
        }
    }
    prop_assert!(false, "reconciliation did not reach a fixpoint");
    unreachable!()
}

/// The active-set definition, recomputed independently: everything
/// reachable from the primary over edges A -> B where A is not in
/// B.is_dead_for.
fn reference_active(states: &[ManagerState], members: &[String]) -> HashSet<String> {
    let Some(primary) = states.iter().find(|s| s.is_primary) else {
        return HashSet::new();
    };
    let mut visited = HashSet::from([primary.name.clone()]);
    let mut queue = VecDeque::from([primary.name.clone()]);
    while let Some(from) = queue.pop_front() {
        for name in members {
            if visited.contains(name) {
                continue;
            }
            let dead_for_from = states
                .iter()
                .find(|s| &s.name == name)
                .is_some_and(|s| s.is_dead_for.contains(&from));
            if !dead_for_from {
                visited.insert(name.clone());
                queue.push_back(name.clone());
            }
        }
    }
    visited
}

fn check_invariants(config: &Config, plan: &Plan) -> Result<(), TestCaseError> {
    // P2: no two VMs share an address.
    let addresses: Vec<Ipv4Addr> = plan.vms.iter().map(|vm| vm.address()).collect();
    let unique: BTreeSet<&Ipv4Addr> = addresses.iter().collect();
    prop_assert_eq!(unique.len(), addresses.len(), "duplicate address in plan");

    for service in &config.services {
        // P1: replica count holds (the active set is never empty here).
        prop_assert_eq!(
            plan.workers_for_service(&service.name).count(),
            service.replicas
        );
        // P3: workers sit inside their manager's pool.
        for worker in plan.workers_for_service(&service.name) {
            let pool = config.manager(worker.manager()).unwrap().address_pool;
            prop_assert!(pool.contains(worker.address()));
        }
        // P4: the LB fronts exactly the planned workers.
        let lbs: Vec<_> = plan.load_balancers_for_service(&service.name).collect();
        if config.load_balancer_for(&service.name).is_some() {
            prop_assert_eq!(lbs.len(), 1);
            let workers: BTreeSet<(Ipv4Addr, u16)> = plan
                .workers_for_service(&service.name)
                .map(|w| (w.address(), w.port()))
                .collect();
            prop_assert_eq!(lbs[0].upstream_set(), workers);
        } else {
            prop_assert!(lbs.is_empty());
        }
    }

    // P5: exactly one primary.
    prop_assert_eq!(
        plan.manager_states.iter().filter(|s| s.is_primary).count(),
        1
    );

    // P6: is_active matches reachability from the primary.
    let members: Vec<String> = config.managers.iter().map(|m| m.name.clone()).collect();
    let expected = reference_active(&plan.manager_states, &members);
    for state in &plan.manager_states {
        prop_assert_eq!(
            state.is_active,
            expected.contains(&state.name),
            "active flag of {} disagrees with reachability",
            state.name
        );
    }

    // Every VM's manager exists and is active.
    for vm in &plan.vms {
        prop_assert!(config.manager(vm.manager()).is_some());
        prop_assert!(expected.contains(vm.manager()));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn invariants_hold_at_fixpoint(
        config in arb_config(),
        seed in any::<u64>(),
        death_mask in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);

        let plan = converge(&config, Plan::default(), &HashSet::new(), &mut rng)?;
        check_invariants(&config, &plan)?;

        // Declare a pseudo-random subset of the first manager's guests
        // dead and converge again.
        let victims: HashSet<Uuid> = plan
            .vms
            .iter()
            .filter(|vm| vm.manager() == config.managers[0].name)
            .enumerate()
            .filter(|(i, _)| (death_mask >> (i % 64)) & 1 == 1)
            .map(|(_, vm)| vm.token())
            .collect();

        let plan = converge(&config, plan, &victims, &mut rng)?;
        check_invariants(&config, &plan)?;
        // Dead tokens never survive replanning.
        prop_assert!(plan.vms.iter().all(|vm| !victims.contains(&vm.token())));
    }

    #[test]
    fn version_always_advances_by_one(config in arb_config(), seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut plan = Plan::default();
        for _ in 0..4 {
            let ctx = ReconcileCtx {
                config: &config,
                plan: &plan,
                self_name: &config.managers[0].name,
                dead: &HashSet::new(),
            };
            match reconcile(&ctx, &mut rng).unwrap() {
                Some(next) => {
                    prop_assert_eq!(next.version, plan.version + 1);
                    plan = next;
                }
                None => break,
            }
        }
    }
}
