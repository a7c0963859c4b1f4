use queuewatch::{
    project, CancelError, CancellationCoordinator, ClearError, ItemStatus, Merge, MessageId,
    QueueEvent, QueueSummary, QueuedItem, Reconciler, SeedMode, Snapshot, Source, StaleEvent,
};

fn item(id: &str, status: ItemStatus) -> QueuedItem {
    QueuedItem {
        status,
        ..QueuedItem::pending(id, format!("content of {}", id), "conv-1", Source::Chat)
    }
}

fn summary(pending_count: u32, is_processing: bool) -> QueueSummary {
    QueueSummary {
        pending_count,
        is_processing,
        ..QueueSummary::default()
    }
}

fn ids(reconciler: &Reconciler) -> Vec<&str> {
    reconciler.items().iter().map(|item| item.id.as_str()).collect()
}

fn scenario_b() -> Reconciler {
    let mut reconciler = Reconciler::new();
    let mode = reconciler.seed(
        Snapshot {
            summary: summary(2, true),
            items: vec![
                item("m1", ItemStatus::Processing),
                item("m2", ItemStatus::Pending),
            ],
        },
        0,
    );
    assert_eq!(mode, SeedMode::Replaced);
    reconciler
}

#[test]
fn empty_snapshot_is_hidden() {
    let mut reconciler = Reconciler::new();
    reconciler.seed(
        Snapshot {
            summary: summary(0, false),
            items: vec![],
        },
        0,
    );

    let visibility = project(reconciler.summary().unwrap(), reconciler.items());
    assert!(!visibility.visible);
}

#[test]
fn snapshot_with_processing_and_pending() {
    let reconciler = scenario_b();

    let visibility = project(reconciler.summary().unwrap(), reconciler.items());
    assert!(visibility.visible);
    assert_eq!(visibility.summary_text, "2 queued · 1 processing");

    let cancellable: Vec<&str> = reconciler
        .items()
        .iter()
        .filter(|item| CancellationCoordinator::can_cancel(item.status))
        .map(|item| item.id.as_str())
        .collect();
    assert_eq!(cancellable, vec!["m2"]);
}

#[test]
fn completion_then_empty_summary_keeps_remaining_item() {
    let mut reconciler = scenario_b();

    reconciler.apply(QueueEvent::MessageCompleted(item("m1", ItemStatus::Completed)));
    reconciler.apply(QueueEvent::StatusUpdate(summary(0, false)));

    assert_eq!(ids(&reconciler), vec!["m2"]);
    assert!(reconciler.divergence().is_some());
    let visibility = project(reconciler.summary().unwrap(), reconciler.items());
    assert!(visibility.visible);

    reconciler.apply(QueueEvent::MessageCancelled(item("m2", ItemStatus::Cancelled)));
    let visibility = project(reconciler.summary().unwrap(), reconciler.items());
    assert!(!visibility.visible);
    assert!(reconciler.divergence().is_none());
}

#[test]
fn duplicate_enqueue_is_ignored() {
    let mut reconciler = Reconciler::new();

    assert_eq!(
        reconciler.upsert_enqueued(item("m1", ItemStatus::Pending)),
        Merge::Applied
    );
    assert_eq!(
        reconciler.upsert_enqueued(item("m1", ItemStatus::Pending)),
        Merge::Stale(StaleEvent::Duplicate)
    );
    assert_eq!(reconciler.items().len(), 1);
}

#[test]
fn enqueue_preserves_arrival_order() {
    let mut reconciler = Reconciler::new();
    for id in ["m3", "m1", "m2"] {
        reconciler.upsert_enqueued(item(id, ItemStatus::Pending));
    }
    assert_eq!(ids(&reconciler), vec!["m3", "m1", "m2"]);
}

#[test]
fn processing_only_moves_pending_items() {
    let mut reconciler = Reconciler::new();
    reconciler.upsert_enqueued(item("m1", ItemStatus::Pending));

    assert_eq!(
        reconciler.mark_processing(item("m1", ItemStatus::Processing)),
        Merge::Applied
    );
    let local = reconciler.get(&MessageId::new("m1")).unwrap();
    assert_eq!(local.status, ItemStatus::Processing);
    assert!(local.processing_started_at.is_some());

    assert_eq!(
        reconciler.mark_processing(item("m1", ItemStatus::Processing)),
        Merge::Stale(StaleEvent::StatusMismatch {
            current: ItemStatus::Processing,
            incoming: ItemStatus::Processing,
        })
    );
}

#[test]
fn unseen_processing_message_is_inserted() {
    let mut reconciler = Reconciler::new();

    reconciler.apply(QueueEvent::MessageProcessing(item("m9", ItemStatus::Processing)));

    assert_eq!(ids(&reconciler), vec!["m9"]);
    assert_eq!(reconciler.items()[0].status, ItemStatus::Processing);
}

#[test]
fn events_after_terminal_are_no_ops() {
    let mut reconciler = Reconciler::new();
    reconciler.apply(QueueEvent::StatusUpdate(summary(1, false)));
    reconciler.apply(QueueEvent::MessageEnqueued(item("m1", ItemStatus::Pending)));
    reconciler.apply(QueueEvent::MessageFailed(QueuedItem {
        error: Some("boom".to_string()),
        ..item("m1", ItemStatus::Failed)
    }));
    let summary_before = reconciler.summary().cloned();

    assert_eq!(
        reconciler.apply(QueueEvent::MessageProcessing(item("m1", ItemStatus::Processing))),
        Merge::Stale(StaleEvent::AlreadyTerminal)
    );
    assert_eq!(
        reconciler.apply(QueueEvent::MessageEnqueued(item("m1", ItemStatus::Pending))),
        Merge::Stale(StaleEvent::AlreadyTerminal)
    );
    assert_eq!(
        reconciler.apply(QueueEvent::MessageCompleted(item("m1", ItemStatus::Completed))),
        Merge::Stale(StaleEvent::AlreadyTerminal)
    );
    assert!(reconciler.items().is_empty());
    assert_eq!(reconciler.summary().cloned(), summary_before);
}

#[test]
fn terminal_event_does_not_touch_summary() {
    let mut reconciler = scenario_b();
    reconciler.apply(QueueEvent::MessageCompleted(item("m1", ItemStatus::Completed)));
    assert_eq!(reconciler.summary(), Some(&summary(2, true)));
}

#[test]
fn removal_requires_terminal_status() {
    let mut reconciler = scenario_b();
    assert_eq!(
        reconciler.remove_terminal(&MessageId::new("m2"), ItemStatus::Processing, None, None),
        Merge::Stale(StaleEvent::UnexpectedStatus(ItemStatus::Processing))
    );
    assert_eq!(reconciler.items().len(), 2);
}

#[test]
fn snapshot_after_events_merges_instead_of_replacing() {
    let mut reconciler = Reconciler::new();
    let issued_at = reconciler.events_applied();

    // m3 arrives and m1 completes while the snapshot request is out.
    reconciler.apply(QueueEvent::MessageEnqueued(item("m3", ItemStatus::Pending)));
    reconciler.apply(QueueEvent::MessageCompleted(item("m1", ItemStatus::Completed)));

    let mode = reconciler.seed(
        Snapshot {
            summary: summary(2, true),
            items: vec![
                item("m1", ItemStatus::Processing),
                item("m2", ItemStatus::Pending),
            ],
        },
        issued_at,
    );

    assert_eq!(mode, SeedMode::Merged);
    assert_eq!(ids(&reconciler), vec!["m3", "m2"]);
}

#[test]
fn newer_summary_event_wins_over_merged_snapshot() {
    let mut reconciler = Reconciler::new();
    let issued_at = reconciler.events_applied();
    reconciler.apply(QueueEvent::StatusUpdate(summary(5, true)));

    reconciler.seed(
        Snapshot {
            summary: summary(1, false),
            items: vec![item("m1", ItemStatus::Pending)],
        },
        issued_at,
    );

    assert_eq!(reconciler.summary(), Some(&summary(5, true)));
}

#[test]
fn terminal_ids_survive_a_replacing_snapshot() {
    let mut reconciler = Reconciler::new();
    reconciler.apply(QueueEvent::MessageEnqueued(item("m1", ItemStatus::Pending)));
    reconciler.apply(QueueEvent::MessageCompleted(item("m1", ItemStatus::Completed)));

    // A refresh issued after the completion replaces the working set.
    let issued_at = reconciler.events_applied();
    let mode = reconciler.seed(
        Snapshot {
            summary: summary(0, false),
            items: vec![],
        },
        issued_at,
    );
    assert_eq!(mode, SeedMode::Replaced);
    assert!(reconciler.is_terminal(&"m1".into()));

    // A processing event delayed in transit must not bring m1 back.
    assert_eq!(
        reconciler.apply(QueueEvent::MessageProcessing(item("m1", ItemStatus::Processing))),
        Merge::Stale(StaleEvent::AlreadyTerminal)
    );
    assert!(reconciler.items().is_empty());
}

#[test]
fn replacing_snapshot_skips_terminal_ids() {
    let mut reconciler = Reconciler::new();
    reconciler.apply(QueueEvent::MessageCancelled(item("m1", ItemStatus::Cancelled)));

    let issued_at = reconciler.events_applied();
    reconciler.seed(
        Snapshot {
            summary: summary(1, false),
            items: vec![item("m1", ItemStatus::Pending), item("m2", ItemStatus::Pending)],
        },
        issued_at,
    );
    assert_eq!(ids(&reconciler), vec!["m2"]);
}

#[test]
fn tombstones_evict_oldest_past_capacity() {
    let mut reconciler = Reconciler::with_tombstone_capacity(3);
    for n in 1..=5 {
        let id = format!("m{}", n);
        reconciler.apply(QueueEvent::MessageEnqueued(item(&id, ItemStatus::Pending)));
        reconciler.apply(QueueEvent::MessageCompleted(item(&id, ItemStatus::Completed)));
    }

    assert_eq!(reconciler.tombstone_count(), 3);
    assert!(!reconciler.is_terminal(&"m1".into()));
    assert!(!reconciler.is_terminal(&"m2".into()));
    for id in ["m3", "m4", "m5"] {
        assert!(reconciler.is_terminal(&id.into()));
    }

    // A repeated terminal event neither grows the set nor evicts.
    reconciler.apply(QueueEvent::MessageFailed(item("m5", ItemStatus::Failed)));
    assert_eq!(reconciler.tombstone_count(), 3);
    assert!(reconciler.is_terminal(&"m3".into()));
}

#[test]
fn divergence_is_not_reported_before_first_snapshot() {
    let mut reconciler = Reconciler::new();
    reconciler.apply(QueueEvent::StatusUpdate(summary(3, true)));
    assert!(!reconciler.is_seeded());
    assert!(reconciler.divergence().is_none());

    let issued_at = reconciler.events_applied();
    reconciler.seed(
        Snapshot {
            summary: summary(3, true),
            items: vec![item("m1", ItemStatus::Processing)],
        },
        issued_at,
    );
    assert!(reconciler.is_seeded());
    let divergence = reconciler.divergence().unwrap();
    assert_eq!(divergence.reported_pending, 3);
    assert_eq!(divergence.local_pending, 1);
}

#[test]
fn cancel_policy_and_in_flight_guard() {
    let reconciler = scenario_b();
    let mut coordinator = CancellationCoordinator::new();
    let m1 = MessageId::new("m1");
    let m2 = MessageId::new("m2");

    assert_eq!(
        coordinator.begin_cancel(&reconciler, &m1),
        Err(CancelError::NotPending {
            id: m1.clone(),
            status: ItemStatus::Processing,
        })
    );
    assert_eq!(
        coordinator.begin_cancel(&reconciler, &MessageId::new("m7")),
        Err(CancelError::NotFound(MessageId::new("m7")))
    );

    assert_eq!(coordinator.begin_cancel(&reconciler, &m2), Ok(()));
    assert!(coordinator.is_in_flight(&m2));
    assert_eq!(
        coordinator.begin_cancel(&reconciler, &m2),
        Err(CancelError::AlreadyInFlight(m2.clone()))
    );

    coordinator.finish_cancel(&m2, &Err(anyhow::anyhow!("rejected")));
    assert!(!coordinator.is_in_flight(&m2));
    assert_eq!(coordinator.begin_cancel(&reconciler, &m2), Ok(()));

    coordinator.finish_cancel(&m2, &Ok(()));
    assert!(coordinator.is_in_flight(&m2));
}

#[test]
fn clear_empties_items_and_queue_counters() {
    let mut reconciler = scenario_b();
    reconciler.apply_summary(QueueSummary {
        total_processed: 7,
        ..summary(2, true)
    });
    let mut coordinator = CancellationCoordinator::new();
    coordinator
        .begin_cancel(&reconciler, &MessageId::new("m2"))
        .unwrap();

    coordinator.begin_clear(&mut reconciler).unwrap();

    assert!(reconciler.items().is_empty());
    let cleared = reconciler.summary().unwrap();
    assert_eq!(cleared.pending_count, 0);
    assert!(!cleared.is_processing);
    assert_eq!(cleared.total_processed, 7);
    assert!(!coordinator.is_in_flight(&MessageId::new("m2")));
    assert_eq!(
        coordinator.begin_clear(&mut reconciler),
        Err(ClearError::AlreadyInFlight)
    );

    assert!(coordinator.finish_clear(&Err(anyhow::anyhow!("nope")), false));
    assert!(!coordinator.is_clearing());
    coordinator.begin_clear(&mut reconciler).unwrap();
    assert!(!coordinator.finish_clear(&Ok(()), false));
}
