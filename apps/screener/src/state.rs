use std::sync::Arc;

use crate::orchestrator::Orchestrator;
use crate::store::StateStore;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Read side of the status API.
    pub store: Arc<dyn StateStore>,
    /// Job submissions go through the orchestrator so the admission rules hold.
    pub orchestrator: Arc<Orchestrator>,
}
