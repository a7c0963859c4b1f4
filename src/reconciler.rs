//! Canonical local copy of the queue, merged from one snapshot and the event stream.
//!
//! The working set only ever holds non-terminal items. Ids that reached a
//! terminal status are remembered, across snapshots and up to a fixed
//! capacity, so that late events or a stale snapshot never bring them back.
//! The summary is taken from the server as is and is
//! never recomputed from the items.

use crate::event::QueueEvent;
use crate::snapshot::Snapshot;
use crate::{ItemStatus, MessageId, QueueSummary, QueuedItem};
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use tracing::*;

/// Outcome of merging one event into the working set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merge {
    Applied,
    Stale(StaleEvent),
}

/// Why an event had no effect. Benign: stale events are expected under reordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleEvent {
    /// The id is already in the working set.
    Duplicate,
    /// The id already reached a terminal status.
    AlreadyTerminal,
    /// The event does not describe a valid transition from the current status.
    StatusMismatch {
        current: ItemStatus,
        incoming: ItemStatus,
    },
    /// The payload status does not fit the event: a terminal enqueue or a
    /// non-terminal removal.
    UnexpectedStatus(ItemStatus),
}

/// How a snapshot was folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedMode {
    /// No event arrived while the snapshot was in flight; it replaced the working set.
    Replaced,
    /// Events arrived in the meantime; only unknown, non-terminal items were added.
    Merged,
}

/// Local item counts disagree with the last authoritative summary.
///
/// `pending_count` covers every unresolved message, the running one included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryDivergence {
    pub reported_pending: u32,
    pub local_pending: usize,
    pub reported_processing: bool,
    pub local_processing: bool,
}

/// Ids remembered as terminal when no capacity is given.
pub const DEFAULT_TOMBSTONE_CAPACITY: usize = 1024;

/// Terminal ids, oldest evicted first once `capacity` is reached.
#[derive(Debug)]
struct Tombstones {
    ids: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl Tombstones {
    fn with_capacity(capacity: usize) -> Self {
        Tombstones {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Returns false if `id` was already remembered.
    fn insert(&mut self, id: MessageId) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                trace!(message_id = %evicted, "Tombstone evicted");
                self.ids.remove(&evicted);
            }
        }
        self.ids.insert(id.clone());
        self.order.push_back(id);
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug)]
pub struct Reconciler {
    items: Vec<QueuedItem>,
    summary: Option<QueueSummary>,
    terminal: Tombstones,
    events_applied: u64,
    summary_applied_at: Option<u64>,
    seeded: bool,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::with_tombstone_capacity(DEFAULT_TOMBSTONE_CAPACITY)
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers at most `capacity` terminal ids (at least one).
    pub fn with_tombstone_capacity(capacity: usize) -> Self {
        Reconciler {
            items: Vec::new(),
            summary: None,
            terminal: Tombstones::with_capacity(capacity),
            events_applied: 0,
            summary_applied_at: None,
            seeded: false,
        }
    }

    /// Working set in arrival order.
    pub fn items(&self) -> &[QueuedItem] {
        &self.items
    }

    pub fn summary(&self) -> Option<&QueueSummary> {
        self.summary.as_ref()
    }

    pub fn get(&self, id: &MessageId) -> Option<&QueuedItem> {
        self.items.iter().find(|item| &item.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.get(id).is_some()
    }

    /// Whether `id` was seen in a terminal status and is still remembered.
    pub fn is_terminal(&self, id: &MessageId) -> bool {
        self.terminal.contains(id)
    }

    pub fn tombstone_count(&self) -> usize {
        self.terminal.len()
    }

    /// Whether a snapshot has been folded in yet.
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Number of events merged so far. Snapshot requests record it when issued.
    pub fn events_applied(&self) -> u64 {
        self.events_applied
    }

    /// Folds a snapshot requested when `events_applied()` was `issued_at`.
    ///
    /// If nothing was merged since, the snapshot is the newest view and replaces
    /// the working set. Otherwise items introduced or removed by those events
    /// win over the snapshot. Either way remembered terminal ids stay out.
    pub fn seed(&mut self, snapshot: Snapshot, issued_at: u64) -> SeedMode {
        let Snapshot { summary, items } = snapshot;

        let mode = if self.events_applied == issued_at {
            self.items.clear();
            for item in items {
                if !item.status.is_terminal()
                    && !self.terminal.contains(&item.id)
                    && !self.contains(&item.id)
                {
                    self.items.push(item);
                }
            }
            self.summary = Some(summary);
            SeedMode::Replaced
        } else {
            for item in items {
                if item.status.is_terminal()
                    || self.terminal.contains(&item.id)
                    || self.contains(&item.id)
                {
                    continue;
                }
                self.items.push(item);
            }
            let summary_is_newer = self
                .summary_applied_at
                .map_or(false, |applied_at| applied_at > issued_at);
            if !summary_is_newer {
                self.summary = Some(summary);
            }
            SeedMode::Merged
        };

        self.seeded = true;
        debug!(mode = ?mode, items = self.items.len(), "Seeded from snapshot");
        self.check_divergence();
        mode
    }

    /// Dispatches an event to its mutation.
    pub fn apply(&mut self, event: QueueEvent) -> Merge {
        match event {
            QueueEvent::StatusUpdate(summary) => self.apply_summary(summary),
            QueueEvent::MessageEnqueued(item) => self.upsert_enqueued(item),
            QueueEvent::MessageProcessing(item) => self.mark_processing(item),
            QueueEvent::MessageCompleted(item) => self.remove_terminal(
                &item.id,
                ItemStatus::Completed,
                item.completed_at,
                item.error.as_deref(),
            ),
            QueueEvent::MessageFailed(item) => self.remove_terminal(
                &item.id,
                ItemStatus::Failed,
                item.completed_at,
                item.error.as_deref(),
            ),
            QueueEvent::MessageCancelled(item) => self.remove_terminal(
                &item.id,
                ItemStatus::Cancelled,
                item.completed_at,
                item.error.as_deref(),
            ),
        }
    }

    pub fn upsert_enqueued(&mut self, item: QueuedItem) -> Merge {
        self.events_applied += 1;

        if item.status.is_terminal() {
            return self.stale(
                &item.id,
                StaleEvent::UnexpectedStatus(item.status),
                "Enqueued event carries a terminal status",
            );
        }
        if self.terminal.contains(&item.id) {
            return self.stale(&item.id, StaleEvent::AlreadyTerminal, "Enqueued after terminal");
        }
        if self.contains(&item.id) {
            return self.stale(&item.id, StaleEvent::Duplicate, "Duplicate enqueue");
        }

        trace!(message_id = %item.id, "Enqueued");
        self.items.push(item);
        Merge::Applied
    }

    /// Moves a pending item to processing. An item this client never saw is
    /// inserted as processing.
    pub fn mark_processing(&mut self, item: QueuedItem) -> Merge {
        self.events_applied += 1;

        if self.terminal.contains(&item.id) {
            return self.stale(&item.id, StaleEvent::AlreadyTerminal, "Processing after terminal");
        }

        let started_at = item.processing_started_at.unwrap_or_else(Utc::now);
        match self.items.iter_mut().find(|local| local.id == item.id) {
            Some(local) if local.status == ItemStatus::Pending => {
                local.status = ItemStatus::Processing;
                local.processing_started_at = Some(started_at);
                trace!(message_id = %local.id, "Processing");
                Merge::Applied
            }
            Some(local) => {
                let current = local.status;
                self.stale(
                    &item.id,
                    StaleEvent::StatusMismatch {
                        current,
                        incoming: ItemStatus::Processing,
                    },
                    "Processing event does not match local status",
                )
            }
            None => {
                trace!(message_id = %item.id, "Processing event for unseen message");
                self.items.push(QueuedItem {
                    status: ItemStatus::Processing,
                    processing_started_at: Some(started_at),
                    ..item
                });
                Merge::Applied
            }
        }
    }

    /// Drops an item that reached `status`. Summary counters are left alone;
    /// only a status update changes them.
    pub fn remove_terminal(
        &mut self,
        id: &MessageId,
        status: ItemStatus,
        at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Merge {
        self.events_applied += 1;

        if !status.is_terminal() {
            return self.stale(
                id,
                StaleEvent::UnexpectedStatus(status),
                "Removal with non-terminal status",
            );
        }
        if !self.terminal.insert(id.clone()) {
            return self.stale(id, StaleEvent::AlreadyTerminal, "Repeated terminal event");
        }

        let before = self.items.len();
        self.items.retain(|item| &item.id != id);
        debug!(
            message_id = %id,
            status = %status,
            at = ?at,
            error = ?error,
            was_present = before != self.items.len(),
            "Removed"
        );
        Merge::Applied
    }

    /// Replaces the summary. The server is authoritative for it.
    pub fn apply_summary(&mut self, summary: QueueSummary) -> Merge {
        self.events_applied += 1;
        self.summary_applied_at = Some(self.events_applied);
        trace!(summary = ?summary, "Summary");
        self.summary = Some(summary);
        if self.seeded {
            self.check_divergence();
        }
        Merge::Applied
    }

    /// Empties the working set and the queue counters of the summary.
    /// Returns the ids that were dropped.
    pub fn clear(&mut self) -> Vec<MessageId> {
        self.summary = Some(
            self.summary
                .as_ref()
                .map(QueueSummary::drained)
                .unwrap_or_default(),
        );
        self.items.drain(..).map(|item| item.id).collect()
    }

    /// Compares the item set against the last summary. Before the first
    /// snapshot the item set is partial, so there is nothing to compare.
    pub fn divergence(&self) -> Option<SummaryDivergence> {
        if !self.seeded {
            return None;
        }
        let summary = self.summary.as_ref()?;
        let local_pending = self.items.len();
        let local_processing = self
            .items
            .iter()
            .any(|item| item.status == ItemStatus::Processing);

        if local_pending == summary.pending_count as usize
            && local_processing == summary.is_processing
        {
            return None;
        }

        Some(SummaryDivergence {
            reported_pending: summary.pending_count,
            local_pending,
            reported_processing: summary.is_processing,
            local_processing,
        })
    }

    fn check_divergence(&self) {
        if let Some(divergence) = self.divergence() {
            warn!(divergence = ?divergence, "Queue summary disagrees with local items");
        }
    }

    fn stale(&self, id: &MessageId, reason: StaleEvent, message: &str) -> Merge {
        debug!(message_id = %id, reason = ?reason, "{}", message);
        Merge::Stale(reason)
    }
}
