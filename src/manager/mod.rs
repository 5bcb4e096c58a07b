//! The manager process core: in-memory copies of the two singletons, the
//! local status table, and the outbound heart set.
//!
//! One `Manager` exists per process. Watch consumers feed it fresh
//! documents, the WebSocket endpoint feeds it beats, and the planner reads
//! it to produce new Plan revisions.

pub mod election;
pub mod planner;
pub mod run;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::heart::{ConnectionStatus, Heart, StatusTable};
use crate::model::{Config, ManagerConfig, Plan, Vm};
use crate::repository::{Repository, RepositoryError};

pub use planner::{reconcile, PlanError, ReconcileCtx};
pub use run::Orchestrator;

/// A running outbound heart towards one peer. The stored fields are what
/// the heart's exit predicate compares against.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PeerHeart {
    host: String,
    self_token: Uuid,
}

pub struct Manager {
    name: String,
    config: RwLock<Config>,
    plan: RwLock<Plan>,
    statuses: StatusTable,
    hearts: DashMap<String, PeerHeart>,
}

impl Manager {
    pub fn new(name: impl Into<String>, config: Config, plan: Plan) -> Self {
        let name = name.into();
        let statuses = StatusTable::new();
        let (peers, vms) = expected_tokens(&config, &plan, &name);
        statuses.sync(&peers, &vms, Utc::now());
        Self {
            name,
            config: RwLock::new(config),
            plan: RwLock::new(plan),
            statuses,
            hearts: DashMap::new(),
        }
    }

    /// Load both singletons once; a missing Config is fatal at startup.
    pub async fn create(
        name: impl Into<String>,
        repository: &Repository,
    ) -> Result<Self, RepositoryError> {
        let config = repository.get_config().await?;
        let plan = repository.get_plan().await?;
        Ok(Self::new(name, config, plan))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn statuses(&self) -> &StatusTable {
        &self.statuses
    }

    pub async fn config(&self) -> Config {
        self.config.read().await.clone()
    }

    pub async fn plan(&self) -> Plan {
        self.plan.read().await.clone()
    }

    pub async fn max_inactive(&self) -> TimeDelta {
        self.config.read().await.general.max_inactive
    }

    /// This manager's own config entry, if the config still lists it.
    pub async fn self_config(&self) -> Option<ManagerConfig> {
        self.config.read().await.manager(&self.name).cloned()
    }

    /// Register an inbound beat. False means the token is not expected
    /// here and the connection should be closed.
    pub fn heartbeat(&self, token: Uuid) -> bool {
        self.statuses.heartbeat(token, Utc::now())
    }

    pub async fn apply_config(&self, config: Config) {
        *self.config.write().await = config;
        self.sync_statuses().await;
    }

    pub async fn apply_plan(&self, plan: Plan) {
        *self.plan.write().await = plan;
        self.sync_statuses().await;
    }

    /// Tokens the local status table currently declares dead.
    pub async fn dead_tokens(&self) -> HashSet<Uuid> {
        let max_inactive = self.max_inactive().await;
        self.statuses.dead_tokens(Utc::now(), max_inactive)
    }

    /// Peer managers with their current local liveness view.
    pub async fn manager_statuses(&self) -> Vec<(ManagerConfig, Option<ConnectionStatus>)> {
        let config = self.config.read().await;
        let max_inactive = config.general.max_inactive;
        let now = Utc::now();
        config
            .other_managers(&self.name)
            .map(|m| (m.clone(), self.statuses.status_of(m.token, now, max_inactive)))
            .collect()
    }

    /// This manager's planned VMs with their current local liveness view.
    pub async fn vm_statuses(&self) -> Vec<(Vm, Option<ConnectionStatus>)> {
        let max_inactive = self.max_inactive().await;
        let plan = self.plan.read().await;
        let now = Utc::now();
        plan.vms_for_manager(&self.name)
            .map(|vm| (vm.clone(), self.statuses.status_of(vm.token(), now, max_inactive)))
            .collect()
    }

    /// Recompute the expected-token set after a config or plan change.
    async fn sync_statuses(&self) {
        let config = self.config.read().await;
        let plan = self.plan.read().await;
        let (peers, vms) = expected_tokens(&config, &plan, &self.name);
        self.statuses.sync(&peers, &vms, Utc::now());
    }

    /// Reconcile the outbound heart set with the current config: spawn a
    /// heart per new peer, retire hearts whose peer left or changed.
    pub async fn sync_hearts(self: &Arc<Self>) {
        let config = self.config.read().await.clone();
        let Some(self_token) = config.manager(&self.name).map(|m| m.token) else {
            warn!("manager '{}' is not present in the configuration", self.name);
            self.hearts.clear();
            return;
        };

        let wanted: Vec<(String, PeerHeart)> = config
            .other_managers(&self.name)
            .map(|peer| {
                (
                    peer.name.clone(),
                    PeerHeart {
                        host: peer.host(),
                        self_token,
                    },
                )
            })
            .collect();

        // Retire stale hearts: their exit predicate turns false once the
        // table entry is gone or replaced.
        self.hearts
            .retain(|name, heart| wanted.iter().any(|(n, h)| n == name && *h == *heart));

        for (peer_name, peer_heart) in wanted {
            if self.hearts.contains_key(&peer_name) {
                continue;
            }
            debug!("starting heart towards '{}' at {}", peer_name, peer_heart.host);
            self.hearts.insert(peer_name.clone(), peer_heart.clone());

            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let heart = Heart::new(peer_heart.host.clone(), peer_heart.self_token);
                heart
                    .beat_until(|| {
                        manager
                            .hearts
                            .get(&peer_name)
                            .map(|current| *current == peer_heart)
                            .unwrap_or(false)
                    })
                    .await;
            });
        }
    }
}

/// The tokens this manager expects beats from: every other manager's, and
/// every local VM's.
fn expected_tokens(
    config: &Config,
    plan: &Plan,
    self_name: &str,
) -> (HashSet<Uuid>, HashSet<Uuid>) {
    let peers = config.other_managers(self_name).map(|m| m.token).collect();
    let vms = plan.vms_for_manager(self_name).map(Vm::token).collect();
    (peers, vms)
}
