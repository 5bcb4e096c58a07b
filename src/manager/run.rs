//! The orchestration loop: watch both singletons, tick once a second, and
//! drive the planner plus the local VM reconciler.
//!
//! Convergence loops never die from one iteration's failure; errors are
//! logged and the next event or tick retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::planner::{reconcile, ReconcileCtx};
use super::Manager;
use crate::model::{Config, Plan};
use crate::repository::Repository;
use crate::vmm::LocalReconciler;

const CORRECTION_INTERVAL: Duration = Duration::from_secs(1);

/// Owns the long-lived convergence tasks of one manager process.
pub struct Orchestrator {
    manager: Arc<Manager>,
    repository: Arc<Repository>,
    reconciler: Arc<LocalReconciler>,
}

impl Orchestrator {
    pub fn new(
        manager: Arc<Manager>,
        repository: Arc<Repository>,
        reconciler: Arc<LocalReconciler>,
    ) -> Self {
        Self {
            manager,
            repository,
            reconciler,
        }
    }

    /// Run until `shutdown` fires. Consumes both watch streams, corrects
    /// the plan periodically, and fans local VM work out per plan change.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut configs = self.repository.watch_config();
        let mut plans = self.repository.watch_plan();
        let mut ticker = interval(CORRECTION_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Converge onto whatever was loaded at startup before the first
        // watch event arrives.
        self.manager.sync_hearts().await;
        self.apply_locally(self.manager.plan().await);
        self.correct_plan().await;

        loop {
            tokio::select! {
                Some(config) = configs.recv() => self.on_config(config).await,
                Some(plan) = plans.recv() => self.on_plan(plan).await,
                _ = ticker.tick() => self.correct_plan().await,
                _ = shutdown.cancelled() => {
                    info!("orchestration loop shutting down");
                    break;
                }
            }
        }
    }

    async fn on_config(&self, config: Config) {
        info!("configuration changed; replanning");
        self.manager.apply_config(config).await;
        self.manager.sync_hearts().await;
        self.correct_plan().await;
    }

    async fn on_plan(&self, plan: Plan) {
        debug!(version = plan.version, "plan changed");
        self.manager.apply_plan(plan.clone()).await;
        self.apply_locally(plan);
        self.correct_plan().await;
    }

    /// Diff the plan against local hypervisor reality on a separate task;
    /// creations can take minutes and must not stall the loop.
    fn apply_locally(&self, plan: Plan) {
        let manager = Arc::clone(&self.manager);
        let reconciler = Arc::clone(&self.reconciler);
        tokio::spawn(async move {
            let config = manager.config().await;
            let report = reconciler.apply(&config, &plan).await;
            let now = chrono::Utc::now();
            for token in report.present.iter().chain(&report.created) {
                manager.statuses().mark_created(*token, now);
            }
        });
    }

    /// One reconciliation attempt: compute a new revision and CAS it in.
    /// A lost race is dropped; the watch stream delivers the winner.
    async fn correct_plan(&self) {
        let config = self.manager.config().await;
        let plan = self.manager.plan().await;
        let dead = self.manager.dead_tokens().await;

        let ctx = ReconcileCtx {
            config: &config,
            plan: &plan,
            self_name: self.manager.name(),
            dead: &dead,
        };
        let outcome = {
            let mut rng = rand::thread_rng();
            reconcile(&ctx, &mut rng)
        };
        match outcome {
            Ok(Some(new_plan)) => {
                let version = new_plan.version;
                match self.repository.save_plan(&new_plan).await {
                    Ok(true) => info!(version, "plan revision saved"),
                    Ok(false) => debug!(version, "lost the plan write race; awaiting watch event"),
                    Err(error) => warn!(version, %error, "could not save plan revision"),
                }
            }
            Ok(None) => {}
            Err(error) => warn!(%error, "replanning failed; will retry on the next tick"),
        }
    }
}
