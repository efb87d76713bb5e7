use std::sync::Arc;

use crate::config::Settings;
use crate::orchestrator::SubscriptionOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub orchestrator: Arc<SubscriptionOrchestrator>,
}

impl AppState {
    pub fn new(settings: Settings, orchestrator: Arc<SubscriptionOrchestrator>) -> Self {
        Self {
            settings: Arc::new(settings),
            orchestrator,
        }
    }
}
