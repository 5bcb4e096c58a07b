//! Manager-state maintenance and primary election.
//!
//! Three passes over `manager_states`: update membership and this
//! manager's dead-for edges, choose the primary, then mark the active set
//! as everything reachable from the primary in the not-dead-for graph.

use std::collections::{HashSet, VecDeque};

use rand::seq::SliceRandom;
use rand::Rng;
use uuid::Uuid;

use crate::model::{Config, ManagerState};

/// Rebuild `manager_states` from the previous plan's states plus local
/// liveness. Returns the new states and whether anything changed.
pub fn rebuild_manager_states(
    config: &Config,
    previous: &[ManagerState],
    self_name: &str,
    dead: &HashSet<Uuid>,
    rng: &mut impl Rng,
) -> (Vec<ManagerState>, bool) {
    let mut states = previous.to_vec();
    let mut changed = false;

    // Pass 1: membership and this manager's dead-for edges. States for
    // managers that left the config are carried but no longer maintained.
    for manager in &config.managers {
        if !states.iter().any(|s| s.name == manager.name) {
            states.push(ManagerState::new(manager.name.clone()));
            changed = true;
        }
        let state = states
            .iter_mut()
            .find(|s| s.name == manager.name)
            .expect("state was just ensured");
        let dead_here = manager.name != self_name && dead.contains(&manager.token);
        if dead_here {
            changed |= state.is_dead_for.insert(self_name.to_string());
        } else {
            changed |= state.is_dead_for.remove(self_name);
        }
    }

    let members: Vec<String> = config.managers.iter().map(|m| m.name.clone()).collect();
    let quorum = config.quorum();

    // Pass 2: primary. Prefer the least-dead member, biased towards self on
    // ties to damp flapping; a healthy primary is never displaced.
    let primary = choose_primary(&states, &members, self_name, quorum, rng);
    for state in &mut states {
        let target = primary.as_deref() == Some(state.name.as_str());
        if state.is_primary != target {
            state.is_primary = target;
            changed = true;
        }
    }

    // Pass 3: active set, by BFS from the primary. An edge A -> B exists
    // when A does not consider B dead.
    let active = reachable_from_primary(&states, &members, primary.as_deref());
    for state in &mut states {
        let target = active.contains(&state.name);
        if state.is_active != target {
            state.is_active = target;
            changed = true;
        }
    }

    (states, changed)
}

fn choose_primary(
    states: &[ManagerState],
    members: &[String],
    self_name: &str,
    quorum: usize,
    rng: &mut impl Rng,
) -> Option<String> {
    let state_of = |name: &str| states.iter().find(|s| s.name == name);

    let mut candidates: Vec<&str> = members.iter().map(String::as_str).collect();
    candidates.shuffle(rng);
    let least_dead = candidates
        .into_iter()
        .min_by_key(|name| {
            let votes = state_of(name).map_or(0, |s| s.is_dead_for.len());
            (votes, *name != self_name)
        })?
        .to_string();

    let current = states
        .iter()
        .find(|s| s.is_primary && members.contains(&s.name))
        .map(|s| s.name.clone());

    match current {
        None => Some(least_dead),
        Some(current) => {
            let current_dead = state_of(&current).is_some_and(|s| s.is_dead(quorum));
            let least_dead_dead = state_of(&least_dead).is_some_and(|s| s.is_dead(quorum));
            if current_dead && !least_dead_dead {
                Some(least_dead)
            } else {
                Some(current)
            }
        }
    }
}

fn reachable_from_primary(
    states: &[ManagerState],
    members: &[String],
    primary: Option<&str>,
) -> HashSet<String> {
    let mut visited = HashSet::new();
    let Some(primary) = primary else {
        return visited;
    };

    visited.insert(primary.to_string());
    let mut queue = VecDeque::from([primary.to_string()]);
    while let Some(from) = queue.pop_front() {
        for name in members {
            if visited.contains(name) {
                continue;
            }
            let considered_dead_by_from = states
                .iter()
                .find(|s| &s.name == name)
                .is_some_and(|s| s.is_dead_for.contains(&from));
            if !considered_dead_by_from {
                visited.insert(name.clone());
                queue.push_back(name.clone());
            }
        }
    }
    visited
}
