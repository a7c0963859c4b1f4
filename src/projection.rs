use crate::cancellation::CancellationCoordinator;
use crate::{QueueSummary, QueuedItem};

const SEPARATOR: &str = " · ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Visibility {
    pub visible: bool,
    pub summary_text: String,
}

impl Visibility {
    pub fn hidden() -> Self {
        Visibility {
            visible: false,
            summary_text: String::new(),
        }
    }
}

/// Derives whether the queue widget shows and what its header says.
///
/// The item check covers the window where a snapshot has loaded items but no
/// status update confirmed them yet.
pub fn project(summary: &QueueSummary, items: &[QueuedItem]) -> Visibility {
    let visible = summary.pending_count > 0 || summary.is_processing || !items.is_empty();

    let mut fragments = Vec::with_capacity(2);
    if summary.pending_count > 0 {
        fragments.push(format!("{} queued", summary.pending_count));
    }
    if summary.is_processing {
        fragments.push("1 processing".to_string());
    }

    Visibility {
        visible,
        summary_text: fragments.join(SEPARATOR),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Loading,
    Ready,
    /// The last snapshot failed; the widget stays hidden until a refresh succeeds.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemView {
    pub item: QueuedItem,
    pub cancel_allowed: bool,
    pub cancel_in_flight: bool,
}

/// Everything the presentation layer needs to render the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueView {
    pub load_state: LoadState,
    pub visible: bool,
    pub summary_text: String,
    pub summary: QueueSummary,
    pub items: Vec<ItemView>,
    pub clearing: bool,
}

impl Default for QueueView {
    fn default() -> Self {
        QueueView {
            load_state: LoadState::Loading,
            visible: false,
            summary_text: String::new(),
            summary: QueueSummary::default(),
            items: Vec::new(),
            clearing: false,
        }
    }
}

impl QueueView {
    pub fn build(
        load_state: LoadState,
        summary: Option<&QueueSummary>,
        items: &[QueuedItem],
        coordinator: &CancellationCoordinator,
    ) -> Self {
        let summary = summary.cloned().unwrap_or_default();
        let visibility = match load_state {
            LoadState::Failed => Visibility::hidden(),
            LoadState::Loading | LoadState::Ready => project(&summary, items),
        };

        QueueView {
            load_state,
            visible: visibility.visible,
            summary_text: visibility.summary_text,
            summary,
            items: items
                .iter()
                .map(|item| ItemView {
                    cancel_allowed: CancellationCoordinator::can_cancel(item.status),
                    cancel_in_flight: coordinator.is_in_flight(&item.id),
                    item: item.clone(),
                })
                .collect(),
            clearing: coordinator.is_clearing(),
        }
    }

    pub fn item(&self, id: &str) -> Option<&ItemView> {
        self.items.iter().find(|view| view.item.id.as_str() == id)
    }
}
