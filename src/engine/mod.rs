mod calendar;
mod conflict;
mod error;
mod mutations;
mod pricing;
mod queries;
mod validate;

pub use calendar::{calendar, day_status};
pub use conflict::{has_conflict, list_conflicts};
pub use error::{EngineError, Violation};
pub use pricing::{price_for, prorate, quote};
pub use validate::validate_booking;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::{BookingNotifier, LogNotifier, NotifyHub};
use crate::wal::Wal;

pub type SharedBillboardState = Arc<RwLock<BillboardState>>;

/// Behaviour knobs fixed for the lifetime of an engine.
#[derive(Clone)]
pub struct EngineOptions {
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn BookingNotifier>,
    /// Drop the implicit blocks of an approved booking when it is cancelled.
    /// Off by default: cancelled approvals keep their dates blocked until the
    /// owner releases them.
    pub reclaim_blocks_on_cancel: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier),
            reclaim_blocks_on_cancel: false,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Rewrite the WAL as the minimal event set for the state it encodes.
    /// Runs on the writer task, so no append can interleave with it.
    Compact {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued, then
/// flush and fsync once for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Flush what we have before compaction or counters see the WAL.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak
    // into the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let result = Wal::replay(wal.path())
                .map(|events| minimal_events(&events))
                .and_then(|events| Wal::write_compact_file(wal.path(), &events))
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedBillboardState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking/block/override id → billboard id.
    pub(super) entity_to_billboard: DashMap<Ulid, Ulid>,
    pub(super) options: EngineOptions,
}

/// Apply an event to a billboard's state; the caller holds its lock.
fn apply_to_billboard(st: &mut BillboardState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    let billboard_id = st.id();
    match event {
        Event::BillboardUpdated { policy, .. } => {
            st.billboard.policy = policy.clone();
        }
        Event::BookingSubmitted { booking } => {
            entity_map.insert(booking.id, billboard_id);
            st.insert_booking(booking.clone());
        }
        Event::BookingApproved { id, block_id, .. } => {
            let Some(booking) = st.booking_mut(*id) else { return };
            booking.status = BookingStatus::Approved;
            let range = booking.range;
            if let Some(block_id) = block_id {
                st.insert_block(BlockedDateRange {
                    id: *block_id,
                    billboard_id,
                    range,
                    origin: BlockOrigin::Booking { booking_id: *id },
                });
                entity_map.insert(*block_id, billboard_id);
            }
        }
        Event::BookingRejected { id, reason, .. } => {
            if let Some(booking) = st.booking_mut(*id) {
                booking.status = BookingStatus::Rejected;
                booking.rejection_reason = reason.clone();
            }
        }
        Event::BookingCancelled { id, released_blocks, .. } => {
            if let Some(booking) = st.booking_mut(*id) {
                booking.status = BookingStatus::Cancelled;
            }
            for block_id in released_blocks {
                st.remove_block(*block_id);
                entity_map.remove(block_id);
            }
        }
        Event::BlockAdded { block } => {
            entity_map.insert(block.id, billboard_id);
            st.insert_block(block.clone());
        }
        Event::BlockRemoved { id, .. } => {
            st.remove_block(*id);
            entity_map.remove(id);
        }
        Event::OverrideAdded { pricing } => {
            entity_map.insert(pricing.id, billboard_id);
            st.overrides.push(pricing.clone());
        }
        Event::OverrideRemoved { id, .. } => {
            st.remove_override(*id);
            entity_map.remove(id);
        }
        // Creation is handled at the DashMap level, not here
        Event::BillboardCreated { .. } => {}
    }
}

/// Fold an event history into the shortest history producing the same state:
/// per billboard, its creation with the current policy, every booking in its
/// current status, the surviving blocks, then overrides in creation order.
pub(crate) fn minimal_events(history: &[Event]) -> Vec<Event> {
    let entity_map = DashMap::new();
    let mut order: Vec<Ulid> = Vec::new();
    let mut states: std::collections::HashMap<Ulid, BillboardState> = std::collections::HashMap::new();

    for event in history {
        match event {
            Event::BillboardCreated { id, owner_id, is_digital, policy } => {
                if !states.contains_key(id) {
                    order.push(*id);
                }
                states.insert(
                    *id,
                    BillboardState::new(Billboard {
                        id: *id,
                        owner_id: *owner_id,
                        is_digital: *is_digital,
                        policy: policy.clone(),
                    }),
                );
            }
            other => {
                if let Some(st) = states.get_mut(&other.billboard_id()) {
                    apply_to_billboard(st, other, &entity_map);
                }
            }
        }
    }

    let mut out = Vec::new();
    for id in order {
        let Some(st) = states.remove(&id) else { continue };
        out.push(Event::BillboardCreated {
            id,
            owner_id: st.billboard.owner_id,
            is_digital: st.billboard.is_digital,
            policy: st.billboard.policy,
        });
        out.extend(st.bookings.into_iter().map(|booking| Event::BookingSubmitted { booking }));
        out.extend(st.blocks.into_iter().map(|block| Event::BlockAdded { block }));
        out.extend(st.overrides.into_iter().map(|pricing| Event::OverrideAdded { pricing }));
    }
    out
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_options(wal_path, notify, EngineOptions::default())
    }

    pub fn with_options(wal_path: PathBuf, notify: Arc<NotifyHub>, options: EngineOptions) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            entity_to_billboard: DashMap::new(),
            options,
        };

        // Replay into plain states first; locks are only wrapped on at the end.
        let mut replayed: std::collections::HashMap<Ulid, BillboardState> = std::collections::HashMap::new();
        for event in &events {
            match event {
                Event::BillboardCreated { id, owner_id, is_digital, policy } => {
                    let st = BillboardState::new(Billboard {
                        id: *id,
                        owner_id: *owner_id,
                        is_digital: *is_digital,
                        policy: policy.clone(),
                    });
                    replayed.insert(*id, st);
                }
                other => {
                    if let Some(st) = replayed.get_mut(&other.billboard_id()) {
                        apply_to_billboard(st, other, &engine.entity_to_billboard);
                    }
                }
            }
        }
        for (id, st) in replayed {
            engine.state.insert(id, Arc::new(RwLock::new(st)));
        }

        tracing::debug!("replayed {} events into {} billboards", events.len(), engine.state.len());
        Ok(engine)
    }

    pub fn today(&self) -> chrono::NaiveDate {
        self.options.clock.today()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_state(&self, id: &Ulid) -> Option<SharedBillboardState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_billboard_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_billboard.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify. The caller holds the billboard's write lock,
    /// which is what makes check-then-commit sequences atomic.
    pub(super) async fn persist_and_apply(
        &self,
        st: &mut BillboardState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_billboard(st, event, &self.entity_to_billboard);
        self.notify.send(st.id(), event);
        Ok(())
    }

    /// Look up a billboard and acquire its write lock.
    pub(super) async fn write_billboard(
        &self,
        billboard_id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<BillboardState>, EngineError> {
        let st = self
            .get_state(&billboard_id)
            .ok_or(EngineError::NotFound(billboard_id))?;
        Ok(st.write_owned().await)
    }

    /// Entity → billboard, then the billboard's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<BillboardState>, EngineError> {
        let billboard_id = self
            .get_billboard_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.write_billboard(billboard_id).await
    }

    pub(super) async fn read_billboard(
        &self,
        billboard_id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<BillboardState>, EngineError> {
        let st = self
            .get_state(&billboard_id)
            .ok_or(EngineError::NotFound(billboard_id))?;
        Ok(st.read_owned().await)
    }
}
