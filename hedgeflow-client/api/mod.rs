pub mod flows;
pub mod middleware;
mod routes;

use std::sync::Arc;

use axum::Router;

use crate::backend::{ExecutionBackend, RetryPolicy};
use crate::connection::manager::ConnectionManager;
use crate::state::store::FlowStateStore;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
    pub store: Arc<FlowStateStore>,
    /// Used directly only by recovery; runs go through the manager.
    pub backend: Arc<dyn ExecutionBackend>,
    pub retry: RetryPolicy,
}

impl AppState {
    pub fn new(backend: Arc<dyn ExecutionBackend>, retry: RetryPolicy) -> Self {
        let manager = Arc::new(ConnectionManager::new(
            backend.clone(),
            Arc::new(FlowStateStore::new()),
            retry,
        ));
        Self {
            store: manager.store().clone(),
            manager,
            backend,
            retry,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}
