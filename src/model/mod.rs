//! Shared data model: the two store singletons and their parts.
//!
//! `Config` is user intent, written by the admin tool and replaced whole.
//! `Plan` is manager intent, rebuilt by reconciliation and written with
//! optimistic concurrency on its version.

pub mod config;
pub mod plan;

pub use config::{
    AddressPool, Config, GeneralSettings, LoadBalancerConfig, ManagerConfig, ServiceConfig,
};
pub use plan::{parse_vm_name, ManagerState, Plan, Vm, VmKind, VmName};
