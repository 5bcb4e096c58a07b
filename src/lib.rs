//! # wsomgr
//!
//! A small multi-node orchestrator that keeps a declared set of services
//! running as KVM guests spread across a fleet of peer managers, each
//! service optionally fronted by its own load balancer.
//!
//! The control plane converges in a loop:
//!
//! 1. The shared store holds two singletons: `Config` (operator intent)
//!    and `Plan` (VM placements plus manager states). Both are watched for
//!    changes.
//! 2. Every manager keeps heartbeat streams open to its peers and accepts
//!    beats from its local guests; liveness is evaluated locally and may
//!    differ between managers.
//! 3. Reconciliation rebuilds the plan from config plus observed health -
//!    electing a primary, computing the active manager set, and placing
//!    workers and load balancers - then writes it back with a
//!    compare-and-swap on the plan version.
//! 4. Each manager diffs the plan against the domains actually present on
//!    its host and creates, deletes, or reconfigures guests to match.
//!
//! There is no consensus layer; the store's compare-and-swap plus the
//! per-manager `is_dead_for` vote sets are the whole coordination story.

pub mod display;
pub mod heart;
pub mod manager;
pub mod model;
pub mod repository;
pub mod server;
pub mod vmm;

pub use manager::{Manager, Orchestrator};
pub use model::{Config, Plan, Vm};
pub use repository::Repository;
