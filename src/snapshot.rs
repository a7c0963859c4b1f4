use crate::error::SnapshotError;
use crate::transport::QueueTransport;
use crate::{QueueSummary, QueuedItem};
use tracing::*;

/// Baseline read of the queue: the aggregate counters and every non-terminal message.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub summary: QueueSummary,
    pub items: Vec<QueuedItem>,
}

/// Fetches both halves of the snapshot concurrently. No retry: a failure of
/// either call fails the whole snapshot.
#[instrument(skip_all)]
pub async fn load(transport: &dyn QueueTransport) -> Result<Snapshot, SnapshotError> {
    let (summary, items) = tokio::join!(
        transport.get_queue_status(),
        transport.get_pending_messages()
    );

    let summary = summary.map_err(SnapshotError::Status)?;
    let items = items.map_err(SnapshotError::Messages)?;
    debug!(
        pending_count = summary.pending_count,
        items = items.len(),
        "Snapshot loaded"
    );

    Ok(Snapshot { summary, items })
}
