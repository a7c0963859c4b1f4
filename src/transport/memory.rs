//! In-process queue server used by the demo binary and the tests.
//!
//! Keeps the authoritative queue, answers the request/response calls and emits
//! the push events a real server would send, synchronously to the registered
//! handlers. Requests can be held open or made to fail to exercise race paths.
//! Reads answer with the queue as it was when the request arrived, so a held
//! read delivers a stale response once released.

use super::{EventHandler, HandlerId, QueueTransport};
use crate::event::{EventKind, QueueEvent};
use crate::{ItemStatus, MessageId, QueueSummary, QueuedItem, Source};
use anyhow::{anyhow, bail, Error};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::*;

#[derive(Default)]
struct ServerQueue {
    items: VecDeque<QueuedItem>,
    total_processed: u64,
    total_failed: u64,
    history_count: u64,
    next_id: u64,
}

impl ServerQueue {
    fn summary(&self) -> QueueSummary {
        QueueSummary {
            pending_count: self.items.len() as u32,
            is_processing: self
                .items
                .iter()
                .any(|item| item.status == ItemStatus::Processing),
            total_processed: self.total_processed,
            total_failed: self.total_failed,
            history_count: self.history_count,
        }
    }

    fn take(&mut self, id: &MessageId) -> Option<QueuedItem> {
        let index = self.items.iter().position(|item| &item.id == id)?;
        self.items.remove(index)
    }

    fn finish(&mut self, mut item: QueuedItem, status: ItemStatus) -> QueuedItem {
        item.status = status;
        item.completed_at = Some(Utc::now());
        self.history_count += 1;
        match status {
            ItemStatus::Completed => self.total_processed += 1,
            ItemStatus::Failed => self.total_failed += 1,
            _ => {}
        }
        item
    }
}

/// Requests received while held wait here, oldest first.
#[derive(Default)]
struct Gate {
    held: bool,
    waiting: VecDeque<oneshot::Sender<()>>,
}

pub struct MemoryTransport {
    queue: Mutex<ServerQueue>,
    handlers: Mutex<HashMap<EventKind, Vec<(HandlerId, EventHandler)>>>,
    gate: Mutex<Gate>,
    fail_status: AtomicBool,
    fail_messages: AtomicBool,
    fail_cancel: AtomicBool,
    fail_clear: AtomicBool,
    status_calls: AtomicUsize,
    messages_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    clear_calls: AtomicUsize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport {
            queue: Mutex::new(ServerQueue::default()),
            handlers: Mutex::new(HashMap::new()),
            gate: Mutex::new(Gate::default()),
            fail_status: AtomicBool::new(false),
            fail_messages: AtomicBool::new(false),
            fail_cancel: AtomicBool::new(false),
            fail_clear: AtomicBool::new(false),
            status_calls: AtomicUsize::new(0),
            messages_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            clear_calls: AtomicUsize::new(0),
        }
    }

    fn queue(&self) -> MutexGuard<'_, ServerQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<(HandlerId, EventHandler)>>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Delivers `event` to every handler registered for its kind.
    pub fn emit(&self, event: QueueEvent) {
        let targets: Vec<EventHandler> = self
            .handlers()
            .get(&event.kind())
            .map(|registered| registered.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        trace!(event = %event.kind(), handlers = targets.len(), "Emitting");
        for handler in targets {
            handler(event.clone());
        }
    }

    fn emit_status(&self) {
        let summary = self.queue().summary();
        self.emit(QueueEvent::StatusUpdate(summary));
    }

    /// Number of handlers currently registered across all event kinds.
    pub fn handler_count(&self) -> usize {
        self.handlers().values().map(Vec::len).sum()
    }

    /// Accepts a new message and announces it.
    pub fn enqueue(&self, content: &str, conversation_id: &str, source: Source) -> MessageId {
        let item = {
            let mut queue = self.queue();
            queue.next_id += 1;
            let item = QueuedItem::pending(
                format!("msg-{}", queue.next_id),
                content,
                conversation_id,
                source,
            );
            queue.items.push_back(item.clone());
            item
        };
        let id = item.id.clone();
        self.emit(QueueEvent::MessageEnqueued(item));
        self.emit_status();
        id
    }

    /// Inserts a message without emitting anything, as if it was queued
    /// before any client connected.
    pub fn seed(&self, item: QueuedItem) {
        self.queue().items.push_back(item);
    }

    /// Moves the oldest pending message to processing, if nothing is running.
    pub fn start_next(&self) -> Option<MessageId> {
        let item = {
            let mut queue = self.queue();
            if queue
                .items
                .iter()
                .any(|item| item.status == ItemStatus::Processing)
            {
                return None;
            }
            let item = queue
                .items
                .iter_mut()
                .find(|item| item.status == ItemStatus::Pending)?;
            item.status = ItemStatus::Processing;
            item.processing_started_at = Some(Utc::now());
            item.clone()
        };
        let id = item.id.clone();
        self.emit(QueueEvent::MessageProcessing(item));
        self.emit_status();
        Some(id)
    }

    /// Resolves a processing message. `error` marks it failed.
    pub fn finish(&self, id: &MessageId, error: Option<String>) -> Result<(), Error> {
        let item = {
            let mut queue = self.queue();
            let item = queue
                .take(id)
                .ok_or_else(|| anyhow!("message {} not found", id))?;
            let status = if error.is_some() {
                ItemStatus::Failed
            } else {
                ItemStatus::Completed
            };
            let mut item = queue.finish(item, status);
            item.error = error;
            item
        };
        let event = match item.status {
            ItemStatus::Failed => QueueEvent::MessageFailed(item),
            _ => QueueEvent::MessageCompleted(item),
        };
        self.emit(event);
        self.emit_status();
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.queue().items.is_empty()
    }

    /// While held, every request/response call waits until released.
    /// Releasing lets every waiting call through.
    pub fn hold_requests(&self, held: bool) {
        let mut gate = self.gate();
        gate.held = held;
        if !held {
            for waiter in gate.waiting.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    /// Number of calls waiting on the hold.
    pub fn held_requests(&self) -> usize {
        self.gate().waiting.len()
    }

    /// Lets the `count` most recently received held calls through.
    pub fn release_latest(&self, count: usize) {
        let mut gate = self.gate();
        for _ in 0..count {
            match gate.waiting.pop_back() {
                Some(waiter) => {
                    let _ = waiter.send(());
                }
                None => break,
            }
        }
    }

    /// Lets the `count` earliest received held calls through.
    pub fn release_oldest(&self, count: usize) {
        let mut gate = self.gate();
        for _ in 0..count {
            match gate.waiting.pop_front() {
                Some(waiter) => {
                    let _ = waiter.send(());
                }
                None => break,
            }
        }
    }

    pub fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    pub fn fail_messages(&self, fail: bool) {
        self.fail_messages.store(fail, Ordering::SeqCst);
    }

    pub fn fail_cancel(&self, fail: bool) {
        self.fail_cancel.store(fail, Ordering::SeqCst);
    }

    pub fn fail_clear(&self, fail: bool) {
        self.fail_clear.store(fail, Ordering::SeqCst);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn messages_calls(&self) -> usize {
        self.messages_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) -> usize {
        self.clear_calls.load(Ordering::SeqCst)
    }

    /// Queues the calling request behind the hold, if one is set.
    fn admit(&self) -> Option<oneshot::Receiver<()>> {
        let mut gate = self.gate();
        if !gate.held {
            return None;
        }
        let (release, released) = oneshot::channel();
        gate.waiting.push_back(release);
        Some(released)
    }

    async fn released(admitted: Option<oneshot::Receiver<()>>) {
        if let Some(released) = admitted {
            // Waiters are only dropped by the gate after being signalled.
            let _ = released.await;
        }
    }
}

#[async_trait]
impl QueueTransport for MemoryTransport {
    async fn get_queue_status(&self) -> Result<QueueSummary, Error> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let admitted = self.admit();
        let response = if self.fail_status.load(Ordering::SeqCst) {
            Err(anyhow!("queue status unavailable"))
        } else {
            Ok(self.queue().summary())
        };
        Self::released(admitted).await;
        response
    }

    async fn get_pending_messages(&self) -> Result<Vec<QueuedItem>, Error> {
        self.messages_calls.fetch_add(1, Ordering::SeqCst);
        let admitted = self.admit();
        let response = if self.fail_messages.load(Ordering::SeqCst) {
            Err(anyhow!("pending messages unavailable"))
        } else {
            Ok(self.queue().items.iter().cloned().collect())
        };
        Self::released(admitted).await;
        response
    }

    async fn cancel_queue_message(&self, id: &MessageId) -> Result<(), Error> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Self::released(self.admit()).await;
        if self.fail_cancel.load(Ordering::SeqCst) {
            bail!("cancel of {} rejected", id);
        }
        let item = {
            let mut queue = self.queue();
            match queue.items.iter().find(|item| &item.id == id) {
                None => bail!("message {} not found", id),
                Some(item) if item.status != ItemStatus::Pending => {
                    bail!("message {} is {}", id, item.status)
                }
                Some(_) => {}
            }
            let item = queue
                .take(id)
                .ok_or_else(|| anyhow!("message {} not found", id))?;
            queue.finish(item, ItemStatus::Cancelled)
        };
        self.emit(QueueEvent::MessageCancelled(item));
        self.emit_status();
        Ok(())
    }

    async fn clear_queue(&self) -> Result<(), Error> {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        Self::released(self.admit()).await;
        if self.fail_clear.load(Ordering::SeqCst) {
            bail!("clear rejected");
        }
        let cancelled: Vec<QueuedItem> = {
            let mut queue = self.queue();
            let drained: Vec<QueuedItem> = queue.items.drain(..).collect();
            drained
                .into_iter()
                .map(|item| queue.finish(item, ItemStatus::Cancelled))
                .collect()
        };
        for item in cancelled {
            self.emit(QueueEvent::MessageCancelled(item));
        }
        self.emit_status();
        Ok(())
    }

    fn on(&self, kind: EventKind, handler: EventHandler) -> HandlerId {
        let id = HandlerId::new();
        self.handlers().entry(kind).or_default().push((id, handler));
        id
    }

    fn off(&self, kind: EventKind, handler: HandlerId) {
        if let Some(registered) = self.handlers().get_mut(&kind) {
            registered.retain(|(id, _)| *id != handler);
        }
    }
}
