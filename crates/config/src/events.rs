//! Event emission configuration.

use serde::Deserialize;

/// Settings for the observability event bus.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventsConfig {
    /// Capacity of the event queue. Records published while the queue is
    /// full are dropped and counted.
    pub queue_capacity: usize,
    /// Whether request and response bodies are included in emitted records.
    pub log_payloads: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            log_payloads: false,
        }
    }
}
