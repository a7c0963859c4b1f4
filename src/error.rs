use crate::{ItemStatus, MessageId};
use thiserror::Error;

/// Either half of the snapshot fetch was rejected.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to fetch queue status: {0:#}")]
    Status(#[source] anyhow::Error),

    #[error("failed to fetch pending messages: {0:#}")]
    Messages(#[source] anyhow::Error),
}

/// Local rejection of a single-message cancel request. None of these reach the transport.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("message {0} is not in the queue")]
    NotFound(MessageId),

    #[error("message {id} is {status}, only pending messages can be cancelled individually")]
    NotPending { id: MessageId, status: ItemStatus },

    #[error("cancellation of message {0} is already in flight")]
    AlreadyInFlight(MessageId),

    #[error("queue monitor is closed")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClearError {
    #[error("clearing the queue is already in flight")]
    AlreadyInFlight,

    #[error("queue monitor is closed")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("queue monitor is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown queue event: {0}")]
    UnknownEvent(String),

    #[error("malformed payload for {event}: {source}")]
    Payload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
