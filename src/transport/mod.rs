use crate::event::{EventKind, QueueEvent};
use crate::{MessageId, QueueSummary, QueuedItem};
use anyhow::Error;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub mod memory;

/// Callback invoked by the push channel for every event of the kind it was registered for.
pub type EventHandler = Arc<dyn Fn(QueueEvent) + Send + Sync>;

/// Registration handle returned by [`QueueTransport::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

impl HandlerId {
    pub fn new() -> Self {
        HandlerId(Uuid::new_v4())
    }
}

impl Default for HandlerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Request/response calls and the push channel of the queue server.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn get_queue_status(&self) -> Result<QueueSummary, Error>;

    /// All non-terminal messages, in queue order.
    async fn get_pending_messages(&self) -> Result<Vec<QueuedItem>, Error>;

    async fn cancel_queue_message(&self, id: &MessageId) -> Result<(), Error>;

    /// Cancels every pending and processing message.
    async fn clear_queue(&self) -> Result<(), Error>;

    fn on(&self, kind: EventKind, handler: EventHandler) -> HandlerId;

    /// Removes a handler previously returned by `on`. Unknown ids are ignored.
    fn off(&self, kind: EventKind, handler: HandlerId);
}
