//! Shared application state for the Axum API server.

use std::sync::Arc;

use mailroom_notifier::pipeline::DispatchPipeline;
use mailroom_notifier::store::DeliveryLogStore;

/// Application state shared across all route handlers via Axum `State`.
///
/// Holds trait objects only, so the router runs unchanged against PostgreSQL and
/// Redis in production and in-memory collaborators in tests.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DeliveryLogStore>,
    pub pipeline: Arc<DispatchPipeline>,
}

impl AppState {
    pub fn new(store: Arc<dyn DeliveryLogStore>, pipeline: Arc<DispatchPipeline>) -> Self {
        Self { store, pipeline }
    }
}
