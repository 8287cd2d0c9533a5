use std::sync::Arc;

use config::Config;
use llm::LlmClient;
use policy::{OrchestratorSettings, events::EventBus, manager::PolicyManager, store::StreamContextStore};

/// Shared state behind every route handler.
pub(crate) struct AppState {
    pub(crate) config: Config,
    pub(crate) manager: Arc<PolicyManager>,
    pub(crate) client: Arc<dyn LlmClient>,
    pub(crate) events: EventBus,
    pub(crate) store: Arc<StreamContextStore>,
}

impl AppState {
    pub(crate) fn new(
        config: Config,
        manager: Arc<PolicyManager>,
        client: Arc<dyn LlmClient>,
        events: EventBus,
        store: Arc<StreamContextStore>,
    ) -> Self {
        Self {
            config,
            manager,
            client,
            events,
            store,
        }
    }

    pub(crate) fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings::from(&self.config.policy)
    }
}
