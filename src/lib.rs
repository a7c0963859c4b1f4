use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod cancellation;
pub mod error;
pub mod event;
pub mod monitor;
pub mod projection;
pub mod reconciler;
pub mod snapshot;
pub mod subscriber;
pub mod telemetry;
pub mod transport;

pub use cancellation::CancellationCoordinator;
pub use error::{CancelError, ClearError, DecodeError, RefreshError, SnapshotError};
pub use event::{EventKind, QueueEvent};
pub use monitor::{MonitorConfig, QueueMonitor};
pub use projection::{project, ItemView, LoadState, QueueView, Visibility};
pub use reconciler::{
    Merge, Reconciler, SeedMode, StaleEvent, SummaryDivergence, DEFAULT_TOMBSTONE_CAPACITY,
};
pub use snapshot::Snapshot;
pub use transport::{memory::MemoryTransport, EventHandler, HandlerId, QueueTransport};

/// Server-assigned identifier of a queued message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        MessageId(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        MessageId(id.to_string())
    }
}

/// Where a queued message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Chat,
    Email,
    Webhook,
    Scheduled,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Cancelled
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedItem {
    pub id: MessageId,
    pub content: String,
    pub conversation_id: String,
    pub source: Source,
    pub status: ItemStatus,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueuedItem {
    /// A freshly enqueued, pending message.
    pub fn pending(
        id: impl Into<MessageId>,
        content: impl Into<String>,
        conversation_id: impl Into<String>,
        source: Source,
    ) -> Self {
        QueuedItem {
            id: id.into(),
            content: content.into(),
            conversation_id: conversation_id.into(),
            source,
            status: ItemStatus::Pending,
            enqueued_at: Utc::now(),
            processing_started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Aggregate queue counters as reported by the server. `pending_count` counts
/// every unresolved message, including the one being processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub pending_count: u32,
    pub is_processing: bool,
    pub total_processed: u64,
    pub total_failed: u64,
    pub history_count: u64,
}

impl QueueSummary {
    /// Same history counters, nothing queued and nothing running.
    pub fn drained(&self) -> Self {
        QueueSummary {
            pending_count: 0,
            is_processing: false,
            ..self.clone()
        }
    }
}
