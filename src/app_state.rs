use std::sync::Arc;

use crate::services::{coordinator::Coordinator, store::RecordStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub store: Arc<dyn RecordStore>,
}

impl AppState {
    pub fn new(coordinator: Coordinator, store: Arc<dyn RecordStore>) -> Self {
        Self { coordinator, store }
    }
}
