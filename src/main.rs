use anyhow::Error;
use clap::Parser;

use queuewatch::telemetry;
use std::{env, sync::Arc, time::Duration};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use queuewatch::{MemoryTransport, MessageId, MonitorConfig, QueueMonitor, QueueView, Source};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about = "Watches a simulated message queue drain")]
pub struct ConfigContext {
    #[arg(
        short = 'n',
        long = "number_messages",
        help = "Number of Messages to Enqueue",
        default_value = "8"
    )]
    num: u16,

    #[arg(
        short = 't',
        long = "tick_ms",
        help = "Dispatcher Tick in Milliseconds",
        default_value = "250"
    )]
    tick_ms: u64,

    #[arg(
        long = "no_resync_after_clear",
        help = "Trust the Optimistic Empty State after Clearing the Queue"
    )]
    no_resync_after_clear: bool,

    #[arg(long = "jaeger_endpoint", help = "Jaeger Collector Endpoint")]
    jaeger_endpoint: Option<String>,
}

fn log_view(view: &QueueView) {
    if !view.visible {
        info!(event = "View", load_state = ?view.load_state, "hidden");
        return;
    }
    let items: Vec<String> = view
        .items
        .iter()
        .map(|row| {
            let marker = if row.cancel_in_flight {
                " (cancelling)"
            } else if row.cancel_allowed {
                " [x]"
            } else {
                ""
            };
            format!("{}:{}{}", row.item.id, row.item.status, marker)
        })
        .collect();
    info!(event = "View", summary = %view.summary_text, items = ?items);
}

// Stands in for the server-side dispatcher: one message at a time, every
// twelfth one fails.
fn dispatch_tick(transport: &MemoryTransport, processing: &mut Option<MessageId>, tick: u64) {
    match processing.take() {
        Some(id) => {
            let error = (tick % 12 == 0).then(|| "Simulating failure".to_string());
            if let Err(err) = transport.finish(&id, error) {
                debug!(message_id = %id, error = %err, "Message left the queue before finishing");
            }
        }
        None => *processing = transport.start_next(),
    }
}

#[instrument(skip(cancel_token, config))]
async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let transport = Arc::new(MemoryTransport::new());

    // Messages queued before the monitor connects only show up through the snapshot.
    for i in 0..config.num / 2 {
        transport.enqueue(&format!("early message {}", i), "conv-1", Source::Chat);
    }

    let monitor = QueueMonitor::init(
        transport.clone(),
        MonitorConfig {
            resync_after_clear: !config.no_resync_after_clear,
        },
    );
    let mut views = monitor.subscribe_view();

    for i in config.num / 2..config.num {
        transport.enqueue(&format!("late message {}", i), "conv-2", Source::Api);
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_ms));
    let mut processing = None;
    let mut tick: u64 = 0;
    let mut cancel_requested = false;

    debug!("Done setting messages");
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Demo Cancelled");
                break;
            },
            changed = views.changed() => {
                if changed.is_err() {
                    debug!("Monitor stopped publishing, exiting");
                    break;
                }
                let view = views.borrow_and_update().clone();
                log_view(&view);
            },
            _ = ticker.tick() => {
                tick += 1;
                dispatch_tick(&transport, &mut processing, tick);

                if !cancel_requested {
                    let view = monitor.view();
                    if let Some(row) = view.items.iter().rev().find(|row| row.cancel_allowed) {
                        cancel_requested = true;
                        if let Err(err) = monitor.cancel(row.item.id.clone()).await {
                            warn!(error = %err, "Cancel rejected");
                        }
                    }
                }

                if tick == 4 * config.num as u64 && !transport.is_empty() {
                    info!("Clearing whatever is left");
                    if let Err(err) = monitor.clear_all().await {
                        warn!(error = %err, "Clear rejected");
                    }
                }

                if tick > 2 && transport.is_empty() && !monitor.view().visible {
                    info!("Queue drained");
                    break;
                }
            }
        }
    }

    println!("Waiting for monitor to shutdown...");
    monitor.dispose().await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigContext::parse();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "queuewatch=DEBUG");
    }

    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cloned_token, config));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(err), _) | (_, Err(err)) => {
                error!(error = %err, "Failed to install signal handlers");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
