//! The `Queue` trait used to deliver `execute`/`resume`/`schedule`
//! messages to workers. See §6 EXTERNAL INTERFACES. Deliveries are
//! at-least-once; the Store deduplicates work via execution status, so
//! a `Queue` implementation never needs its own dedup logic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueueError;
use crate::model::ExecutionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Execute,
    Resume,
    Schedule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_type: MessageType,
    pub execution_id: ExecutionId,
    pub payload: Value,
    pub max_attempts: u32,
}

impl QueueMessage {
    pub fn execute(execution_id: ExecutionId) -> Self {
        Self { message_type: MessageType::Execute, execution_id, payload: Value::Null, max_attempts: 1 }
    }

    pub fn resume(execution_id: ExecutionId) -> Self {
        Self { message_type: MessageType::Resume, execution_id, payload: Value::Null, max_attempts: 1 }
    }
}

/// A message handed to a queue consumer, with the ack/nack split the
/// donor crate's worker pool also exposes for at-least-once delivery.
pub struct Delivery {
    pub message: QueueMessage,
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError>;

    /// Pop the next available message, if any, without blocking.
    async fn poll(&self) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
    async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<(), QueueError>;

    async fn init(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn dispose(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
