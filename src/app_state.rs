//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::domain::EventBus;
use crate::service::{DatabaseService, InboundService, Reconciler};

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Inbound, client and link operations.
    pub inbounds: InboundService,
    /// Database export and import.
    pub database: DatabaseService,
    /// Xray lifecycle.
    pub reconciler: Arc<Reconciler>,
    /// Event bus notifiers subscribe to.
    pub event_bus: EventBus,
}
