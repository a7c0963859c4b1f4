use crate::event::{EventKind, QueueEvent};
use crate::transport::{HandlerId, QueueTransport};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::*;

/// One handler per [`EventKind`], registered on a transport's push channel.
///
/// Every handler only forwards its event into the channel; the receiving side
/// applies it. Dropping the subscription unregisters whatever is still registered.
pub struct EventSubscription {
    transport: Arc<dyn QueueTransport>,
    registered: Vec<(EventKind, HandlerId)>,
}

impl EventSubscription {
    pub fn register(
        transport: Arc<dyn QueueTransport>,
        send_to_monitor: UnboundedSender<QueueEvent>,
    ) -> Self {
        let registered = EventKind::ALL
            .into_iter()
            .map(|kind| {
                let send_to_monitor = send_to_monitor.clone();
                let handler_id = transport.on(
                    kind,
                    Arc::new(move |event: QueueEvent| {
                        // A closed channel means the monitor is gone; nothing left to update.
                        let _ = send_to_monitor.send(event);
                    }),
                );
                trace!(event = %kind, handler_id = %handler_id, "Registered handler");
                (kind, handler_id)
            })
            .collect();

        EventSubscription {
            transport,
            registered,
        }
    }

    /// The `(kind, handler)` pairs currently registered.
    pub fn registered(&self) -> &[(EventKind, HandlerId)] {
        &self.registered
    }

    /// Unregisters exactly the handlers `register` added.
    pub fn unregister(&mut self) {
        for (kind, handler_id) in self.registered.drain(..) {
            self.transport.off(kind, handler_id);
            trace!(event = %kind, handler_id = %handler_id, "Unregistered handler");
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.unregister();
    }
}
