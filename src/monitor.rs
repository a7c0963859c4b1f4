//! One activation of the queue view: subscribe, load, merge, cancel, tear down.
//!
//! All state lives in a single task. Push events, user commands and finished
//! transport requests are handled one at a time by its select loop, so no two
//! mutations ever interleave. Handlers are registered before the snapshot
//! request goes out; events that race the snapshot are merged, never lost.

use crate::cancellation::CancellationCoordinator;
use crate::error::{CancelError, ClearError, RefreshError, SnapshotError};
use crate::event::QueueEvent;
use crate::projection::{LoadState, QueueView};
use crate::reconciler::Reconciler;
use crate::snapshot::{self, Snapshot};
use crate::subscriber::EventSubscription;
use crate::transport::QueueTransport;
use crate::MessageId;
use anyhow::Error;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Re-fetch the snapshot after a successful clear-all instead of trusting
    /// the optimistic empty state.
    pub resync_after_clear: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            resync_after_clear: true,
        }
    }
}

#[derive(Debug)]
enum Command {
    Cancel {
        id: MessageId,
        reply: oneshot::Sender<Result<(), CancelError>>,
    },
    ClearAll {
        reply: oneshot::Sender<Result<(), ClearError>>,
    },
    Refresh,
}

#[derive(Debug)]
enum Completion {
    Snapshot {
        generation: u64,
        issued_at: u64,
        result: Result<Snapshot, SnapshotError>,
    },
    Cancel {
        id: MessageId,
        result: Result<(), Error>,
    },
    Clear {
        result: Result<(), Error>,
    },
}

/// Handle to a running activation. Dropping it stops the activation;
/// [`dispose`](QueueMonitor::dispose) also waits for the teardown to finish.
pub struct QueueMonitor {
    send_to_monitor: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<QueueView>,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
    _drop_guard: DropGuard,
}

impl QueueMonitor {
    /// Subscribes to `transport` and starts loading the snapshot. Must be
    /// called from within a tokio runtime.
    pub fn init(transport: Arc<dyn QueueTransport>, config: MonitorConfig) -> Self {
        let (send_events, recv_events) = mpsc::unbounded_channel();
        let subscription = EventSubscription::register(transport.clone(), send_events);

        let (send_to_monitor, recv_commands) = mpsc::unbounded_channel();
        let (publish, view) = watch::channel(QueueView::default());
        let cancel_token = CancellationToken::new();

        let state = MonitorState {
            transport,
            config,
            reconciler: Reconciler::new(),
            coordinator: CancellationCoordinator::new(),
            load_state: LoadState::Loading,
            snapshot_generation: 0,
            snapshot_in_flight: false,
            refetch_after_clear: false,
            pending: FuturesUnordered::new(),
            publish,
        };

        let task = tokio::spawn(
            run(
                state,
                subscription,
                cancel_token.clone(),
                recv_events,
                recv_commands,
            )
            .instrument(info_span!("queue_monitor")),
        );

        QueueMonitor {
            send_to_monitor,
            view,
            _drop_guard: cancel_token.clone().drop_guard(),
            cancel_token,
            task,
        }
    }

    /// Requests cancellation of a pending message. Resolves once the request
    /// is issued; removal happens when the server confirms with an event.
    pub async fn cancel(&self, id: impl Into<MessageId>) -> Result<(), CancelError> {
        let (reply, response) = oneshot::channel();
        self.send_to_monitor
            .send(Command::Cancel {
                id: id.into(),
                reply,
            })
            .map_err(|_| CancelError::Closed)?;
        response.await.map_err(|_| CancelError::Closed)?
    }

    /// Cancels the whole queue, emptying the local view right away.
    pub async fn clear_all(&self) -> Result<(), ClearError> {
        let (reply, response) = oneshot::channel();
        self.send_to_monitor
            .send(Command::ClearAll { reply })
            .map_err(|_| ClearError::Closed)?;
        response.await.map_err(|_| ClearError::Closed)?
    }

    /// Repeats the snapshot fetch.
    pub fn refresh(&self) -> Result<(), RefreshError> {
        self.send_to_monitor
            .send(Command::Refresh)
            .map_err(|_| RefreshError::Closed)
    }

    pub fn view(&self) -> QueueView {
        self.view.borrow().clone()
    }

    /// A receiver notified after every state change.
    pub fn subscribe_view(&self) -> watch::Receiver<QueueView> {
        self.view.clone()
    }

    /// Stops the activation: handlers are unregistered and any outstanding
    /// request is abandoned without touching state.
    pub async fn dispose(self) {
        let QueueMonitor {
            cancel_token, task, ..
        } = self;
        cancel_token.cancel();
        if let Err(err) = task.await {
            error!(error = ?err, "Queue monitor task failed");
        }
    }
}

struct MonitorState {
    transport: Arc<dyn QueueTransport>,
    config: MonitorConfig,
    reconciler: Reconciler,
    coordinator: CancellationCoordinator,
    load_state: LoadState,
    snapshot_generation: u64,
    snapshot_in_flight: bool,
    refetch_after_clear: bool,
    pending: FuturesUnordered<BoxFuture<'static, Completion>>,
    publish: watch::Sender<QueueView>,
}

async fn run(
    mut state: MonitorState,
    mut subscription: EventSubscription,
    cancel_token: CancellationToken,
    mut recv_events: mpsc::UnboundedReceiver<QueueEvent>,
    mut recv_commands: mpsc::UnboundedReceiver<Command>,
) {
    state.request_snapshot();
    state.publish();

    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                debug!("Queue monitor cancelled");
                break;
            },
            event = recv_events.recv() => {
                match event {
                    Some(event) => state.apply_event(event),
                    None => {
                        debug!("Event channel closed unexpectedly, exiting");
                        break;
                    }
                }
            },
            command = recv_commands.recv() => {
                match command {
                    Some(command) => state.handle_command(command),
                    None => {
                        debug!("Monitor handle dropped, exiting");
                        break;
                    }
                }
            },
            Some(completion) = state.pending.next() => {
                state.complete(completion);
            },
        }
    }

    subscription.unregister();
    if !state.pending.is_empty() {
        debug!(abandoned = state.pending.len(), "Abandoning outstanding requests");
    }
    info!("Queue monitor stopped.");
}

impl MonitorState {
    fn request_snapshot(&mut self) {
        self.snapshot_generation += 1;
        self.snapshot_in_flight = true;
        let generation = self.snapshot_generation;
        let issued_at = self.reconciler.events_applied();
        let transport = self.transport.clone();
        debug!(generation, "Requesting snapshot");

        self.pending.push(Box::pin(async move {
            let result = snapshot::load(transport.as_ref()).await;
            Completion::Snapshot {
                generation,
                issued_at,
                result,
            }
        }));
    }

    fn apply_event(&mut self, event: QueueEvent) {
        trace!(event = %event.kind(), "Event");
        let removed = event.terminal_id().cloned();
        self.reconciler.apply(event);
        if let Some(id) = removed {
            self.coordinator.forget(&id);
        }
        self.publish();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Cancel { id, reply } => {
                let accepted = self.coordinator.begin_cancel(&self.reconciler, &id);
                if accepted.is_ok() {
                    let transport = self.transport.clone();
                    let request_id = id.clone();
                    self.pending.push(Box::pin(async move {
                        let result = transport.cancel_queue_message(&request_id).await;
                        Completion::Cancel {
                            id: request_id,
                            result,
                        }
                    }));
                    self.publish();
                } else if let Err(err) = &accepted {
                    debug!(message_id = %id, error = %err, "Cancel rejected");
                }
                let _ = reply.send(accepted);
            }
            Command::ClearAll { reply } => {
                let accepted = self.coordinator.begin_clear(&mut self.reconciler);
                if accepted.is_ok() {
                    if self.snapshot_in_flight {
                        // The outstanding snapshot predates the clear; drop it and fetch again afterwards.
                        self.snapshot_generation += 1;
                        self.snapshot_in_flight = false;
                        self.refetch_after_clear = true;
                    }
                    let transport = self.transport.clone();
                    self.pending.push(Box::pin(async move {
                        let result = transport.clear_queue().await;
                        Completion::Clear { result }
                    }));
                    self.publish();
                } else {
                    debug!("Clear rejected, already in flight");
                }
                let _ = reply.send(accepted);
            }
            Command::Refresh => self.request_snapshot(),
        }
    }

    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::Snapshot {
                generation,
                issued_at,
                result,
            } => {
                if generation != self.snapshot_generation {
                    debug!(generation, "Dropping superseded snapshot");
                    return;
                }
                self.snapshot_in_flight = false;
                match result {
                    Ok(snapshot) => {
                        self.reconciler.seed(snapshot, issued_at);
                        self.coordinator.retain_present(&self.reconciler);
                        self.load_state = LoadState::Ready;
                    }
                    Err(err) => {
                        error!(error = %err, "Snapshot failed, hiding queue until refreshed");
                        self.load_state = LoadState::Failed;
                    }
                }
            }
            Completion::Cancel { id, result } => {
                self.coordinator.finish_cancel(&id, &result);
            }
            Completion::Clear { result } => {
                let resync = self
                    .coordinator
                    .finish_clear(&result, self.config.resync_after_clear);
                let superseded = std::mem::take(&mut self.refetch_after_clear);
                if resync || superseded {
                    self.request_snapshot();
                }
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.publish.send_replace(QueueView::build(
            self.load_state,
            self.reconciler.summary(),
            self.reconciler.items(),
            &self.coordinator,
        ));
    }
}
