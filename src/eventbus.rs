//! Pub/sub channels, primarily `execution:<id>` for completion
//! notification. See §6 EXTERNAL INTERFACES.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EventBusError;
use crate::model::ExecutionId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn finished(payload: Value) -> Self {
        Self { event_type: "finished".to_string(), payload, timestamp: Utc::now() }
    }
}

pub fn execution_channel(id: ExecutionId) -> String {
    format!("execution:{id}")
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, event: Event) -> Result<(), EventBusError>;

    /// Subscribe to `channel`, returning a receiver of future events.
    /// Implementations that cannot support subscription (e.g. a
    /// polling-only bus) should return `EventBusError::Backend` so
    /// callers fall back to pure polling per §4.3 WaitManager.
    async fn subscribe(&self, channel: &str) -> Result<tokio::sync::broadcast::Receiver<Event>, EventBusError>;

    async fn unsubscribe(&self, _channel: &str) -> Result<(), EventBusError> {
        Ok(())
    }

    async fn init(&self) -> Result<(), EventBusError> {
        Ok(())
    }

    async fn dispose(&self) -> Result<(), EventBusError> {
        Ok(())
    }
}
