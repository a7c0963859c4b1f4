//! The closed set of queue push events and their wire names.

use crate::error::DecodeError;
use crate::{MessageId, QueueSummary, QueuedItem};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StatusUpdate,
    MessageEnqueued,
    MessageProcessing,
    MessageCompleted,
    MessageFailed,
    MessageCancelled,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::StatusUpdate,
        EventKind::MessageEnqueued,
        EventKind::MessageProcessing,
        EventKind::MessageCompleted,
        EventKind::MessageFailed,
        EventKind::MessageCancelled,
    ];

    /// Name used on the push channel.
    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::StatusUpdate => "queue:status_update",
            EventKind::MessageEnqueued => "queue:message_enqueued",
            EventKind::MessageProcessing => "queue:message_processing",
            EventKind::MessageCompleted => "queue:message_completed",
            EventKind::MessageFailed => "queue:message_failed",
            EventKind::MessageCancelled => "queue:message_cancelled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for EventKind {
    type Err = DecodeError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.wire_name() == name)
            .ok_or_else(|| DecodeError::UnknownEvent(name.to_string()))
    }
}

/// A decoded push event. Message events carry the full item as the server sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    StatusUpdate(QueueSummary),
    MessageEnqueued(QueuedItem),
    MessageProcessing(QueuedItem),
    MessageCompleted(QueuedItem),
    MessageFailed(QueuedItem),
    MessageCancelled(QueuedItem),
}

impl QueueEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            QueueEvent::StatusUpdate(_) => EventKind::StatusUpdate,
            QueueEvent::MessageEnqueued(_) => EventKind::MessageEnqueued,
            QueueEvent::MessageProcessing(_) => EventKind::MessageProcessing,
            QueueEvent::MessageCompleted(_) => EventKind::MessageCompleted,
            QueueEvent::MessageFailed(_) => EventKind::MessageFailed,
            QueueEvent::MessageCancelled(_) => EventKind::MessageCancelled,
        }
    }

    /// Id of the message this event takes out of the queue, if any.
    pub fn terminal_id(&self) -> Option<&MessageId> {
        match self {
            QueueEvent::MessageCompleted(item)
            | QueueEvent::MessageFailed(item)
            | QueueEvent::MessageCancelled(item) => Some(&item.id),
            _ => None,
        }
    }

    /// Decodes a JSON payload received under `name` on the push channel.
    pub fn decode(name: &str, payload: &str) -> Result<Self, DecodeError> {
        let kind: EventKind = name.parse()?;
        let malformed = |source| DecodeError::Payload {
            event: kind.wire_name(),
            source,
        };

        let event = match kind {
            EventKind::StatusUpdate => {
                QueueEvent::StatusUpdate(serde_json::from_str(payload).map_err(malformed)?)
            }
            EventKind::MessageEnqueued => {
                QueueEvent::MessageEnqueued(serde_json::from_str(payload).map_err(malformed)?)
            }
            EventKind::MessageProcessing => {
                QueueEvent::MessageProcessing(serde_json::from_str(payload).map_err(malformed)?)
            }
            EventKind::MessageCompleted => {
                QueueEvent::MessageCompleted(serde_json::from_str(payload).map_err(malformed)?)
            }
            EventKind::MessageFailed => {
                QueueEvent::MessageFailed(serde_json::from_str(payload).map_err(malformed)?)
            }
            EventKind::MessageCancelled => {
                QueueEvent::MessageCancelled(serde_json::from_str(payload).map_err(malformed)?)
            }
        };

        Ok(event)
    }
}
