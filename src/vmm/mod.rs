//! Local VM management: diff the plan against hypervisor reality and
//! converge with create/delete/reconfigure actions.
//!
//! The hypervisor and the provisioning playbooks are external
//! collaborators behind the [`Hypervisor`] and [`Provisioner`] seams; the
//! convergence flow itself lives in [`LocalReconciler`].

pub mod driver;
pub mod provision;
pub mod reconciler;
pub mod xml;

pub use driver::{Hypervisor, VirshHypervisor, VmmError};
pub use provision::{AnsibleProvisioner, Provisioner};
pub use reconciler::{diff_local, ApplyReport, LocalReconciler, VmDiff};
