//! Bookkeeping for user-initiated cancellation.
//!
//! The coordinator decides whether a request may go out and tracks what is in
//! flight; the monitor performs the actual transport calls. Cancel-in-flight is
//! kept apart from [`QueuedItem::status`](crate::QueuedItem), so an
//! authoritative terminal event and a failed cancel response can resolve in
//! either order.

use crate::error::{CancelError, ClearError};
use crate::reconciler::Reconciler;
use crate::{ItemStatus, MessageId};
use std::collections::HashSet;
use tracing::*;

#[derive(Debug, Default)]
pub struct CancellationCoordinator {
    in_flight: HashSet<MessageId>,
    clearing: bool,
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self, id: &MessageId) -> bool {
        self.in_flight.contains(id)
    }

    pub fn is_clearing(&self) -> bool {
        self.clearing
    }

    /// Only pending items can be cancelled one by one; processing items go
    /// through clear-all.
    pub fn can_cancel(status: ItemStatus) -> bool {
        status == ItemStatus::Pending
    }

    /// Marks `id` as cancel-in-flight if the request may be issued.
    pub fn begin_cancel(
        &mut self,
        reconciler: &Reconciler,
        id: &MessageId,
    ) -> Result<(), CancelError> {
        if self.in_flight.contains(id) {
            return Err(CancelError::AlreadyInFlight(id.clone()));
        }
        let item = reconciler
            .get(id)
            .ok_or_else(|| CancelError::NotFound(id.clone()))?;
        if !Self::can_cancel(item.status) {
            return Err(CancelError::NotPending {
                id: id.clone(),
                status: item.status,
            });
        }

        self.in_flight.insert(id.clone());
        debug!(message_id = %id, "Cancel in flight");
        Ok(())
    }

    /// Settles a cancel request. On success the marker stays until the
    /// message_cancelled event removes the item; on failure it is cleared so
    /// the control is enabled again.
    pub fn finish_cancel(&mut self, id: &MessageId, result: &Result<(), anyhow::Error>) {
        match result {
            Ok(()) => debug!(message_id = %id, "Cancel accepted"),
            Err(err) => {
                warn!(message_id = %id, error = %err, "Cancel failed");
                self.in_flight.remove(id);
            }
        }
    }

    /// Forgets the marker of an item that left the working set.
    pub fn forget(&mut self, id: &MessageId) {
        self.in_flight.remove(id);
    }

    /// Drops markers of ids no longer in the working set.
    pub fn retain_present(&mut self, reconciler: &Reconciler) {
        self.in_flight.retain(|id| reconciler.contains(id));
    }

    /// Starts clear-all and optimistically empties the local queue.
    pub fn begin_clear(&mut self, reconciler: &mut Reconciler) -> Result<(), ClearError> {
        if self.clearing {
            return Err(ClearError::AlreadyInFlight);
        }
        self.clearing = true;
        let cleared = reconciler.clear();
        for id in &cleared {
            self.in_flight.remove(id);
        }
        debug!(cleared = cleared.len(), "Clear in flight");
        Ok(())
    }

    /// Settles clear-all. Returns whether local state must be re-fetched.
    pub fn finish_clear(&mut self, result: &Result<(), anyhow::Error>, resync: bool) -> bool {
        self.clearing = false;
        match result {
            Ok(()) => {
                debug!("Clear accepted");
                resync
            }
            Err(err) => {
                warn!(error = %err, "Clear failed, queue will be re-fetched");
                true
            }
        }
    }
}
