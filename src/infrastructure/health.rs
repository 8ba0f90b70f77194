use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use strum_macros::Display;
use tracing::warn;

use crate::domain::OutboxStatusCounts;
use crate::infrastructure::kafka_abstraction::MessagePublisherTrait;
use crate::infrastructure::outbox::OutboxRepositoryTrait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ComponentState {
    Starting,
    Running,
    Stopped,
}

/// Liveness of every background loop, keyed by component name.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    components: Arc<DashMap<String, ComponentState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, component: &str) {
        self.components
            .insert(component.to_string(), ComponentState::Starting);
    }

    pub fn set(&self, component: &str, state: ComponentState) {
        self.components.insert(component.to_string(), state);
    }

    pub fn state(&self, component: &str) -> Option<ComponentState> {
        self.components.get(component).map(|entry| *entry.value())
    }

    /// True when at least one component is registered and all are running.
    pub fn all_running(&self) -> bool {
        !self.components.is_empty()
            && self
                .components
                .iter()
                .all(|entry| *entry.value() == ComponentState::Running)
    }

    pub fn snapshot(&self) -> BTreeMap<String, ComponentState> {
        self.components
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub ready: bool,
    pub broker_connected: bool,
    pub components: BTreeMap<String, ComponentState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbox: Option<OutboxStatusCounts>,
}

pub struct HealthService {
    registry: HealthRegistry,
    publisher: Arc<dyn MessagePublisherTrait>,
    outbox: Arc<dyn OutboxRepositoryTrait>,
}

impl HealthService {
    pub fn new(
        registry: HealthRegistry,
        publisher: Arc<dyn MessagePublisherTrait>,
        outbox: Arc<dyn OutboxRepositoryTrait>,
    ) -> Self {
        Self {
            registry,
            publisher,
            outbox,
        }
    }

    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    pub async fn is_ready(&self) -> bool {
        self.registry.all_running() && self.publisher.is_connected().await
    }

    pub async fn report(&self) -> HealthReport {
        let broker_connected = self.publisher.is_connected().await;
        let outbox = match self.outbox.count_by_status().await {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!("Health report could not count outbox messages: {:#}", e);
                None
            }
        };
        let ready = broker_connected && self.registry.all_running();

        HealthReport {
            status: if ready { "healthy" } else { "degraded" },
            ready,
            broker_connected,
            components: self.registry.snapshot(),
            outbox,
        }
    }
}
