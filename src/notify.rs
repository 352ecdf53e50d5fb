use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::{DateRange, Event};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub of committed events, one channel per billboard.
/// Read-side projections subscribe here instead of polling the engine.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a billboard's events. Creates the channel if needed.
    pub fn subscribe(&self, billboard_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(billboard_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, billboard_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&billboard_id) {
            let _ = sender.send(event.clone());
        }
    }
}

// ── Outward collaborators ────────────────────────────────────────

/// What email/push/chat collaborators need to know about a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingNotice {
    pub booking_id: Ulid,
    pub billboard_id: Ulid,
    pub owner_id: Ulid,
    pub requester_id: Ulid,
    pub range: DateRange,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Submitted,
    Approved,
    Rejected,
    Cancelled,
}

pub type NotifyResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Boundary to the systems that tell people about bookings.
/// Calls are best-effort: a failure is logged and never undoes the transition.
#[async_trait]
pub trait BookingNotifier: Send + Sync {
    async fn booking_submitted(&self, notice: &BookingNotice) -> NotifyResult;
    async fn booking_approved(&self, notice: &BookingNotice) -> NotifyResult;
    async fn booking_rejected(&self, notice: &BookingNotice) -> NotifyResult;
    async fn booking_cancelled(&self, notice: &BookingNotice) -> NotifyResult;
}

/// Default collaborator: writes a log line per notice.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl BookingNotifier for LogNotifier {
    async fn booking_submitted(&self, n: &BookingNotice) -> NotifyResult {
        info!(booking = %n.booking_id, billboard = %n.billboard_id, range = %n.range, "booking submitted");
        Ok(())
    }

    async fn booking_approved(&self, n: &BookingNotice) -> NotifyResult {
        info!(booking = %n.booking_id, billboard = %n.billboard_id, range = %n.range, "booking approved");
        Ok(())
    }

    async fn booking_rejected(&self, n: &BookingNotice) -> NotifyResult {
        info!(booking = %n.booking_id, billboard = %n.billboard_id, reason = ?n.reason, "booking rejected");
        Ok(())
    }

    async fn booking_cancelled(&self, n: &BookingNotice) -> NotifyResult {
        info!(booking = %n.booking_id, billboard = %n.billboard_id, "booking cancelled");
        Ok(())
    }
}

/// Hand a notice to the collaborator on its own task and return immediately.
pub fn dispatch(notifier: &Arc<dyn BookingNotifier>, kind: NoticeKind, notice: BookingNotice) {
    let notifier = notifier.clone();
    tokio::spawn(async move {
        let result = match kind {
            NoticeKind::Submitted => notifier.booking_submitted(&notice).await,
            NoticeKind::Approved => notifier.booking_approved(&notice).await,
            NoticeKind::Rejected => notifier.booking_rejected(&notice).await,
            NoticeKind::Cancelled => notifier.booking_cancelled(&notice).await,
        };
        if let Err(e) = result {
            metrics::counter!(crate::observability::NOTIFY_FAILURES_TOTAL).increment(1);
            warn!("notifier failed for booking {} ({kind:?}): {e}", notice.booking_id);
        }
    });
}
