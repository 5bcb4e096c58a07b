//! Shared state injected into the HTTP handlers.

use std::sync::Arc;

use crate::manager::Manager;
use crate::vmm::LocalReconciler;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub reconciler: Arc<LocalReconciler>,
}

impl AppState {
    pub fn new(manager: Arc<Manager>, reconciler: Arc<LocalReconciler>) -> Self {
        Self {
            manager,
            reconciler,
        }
    }
}
