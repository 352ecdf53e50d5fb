use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{dispatch, BookingNotice, NoticeKind};
use crate::observability;

use super::conflict::{find_conflict, validate_range};
use super::pricing::quote;
use super::validate::validate_booking;
use super::{Engine, EngineError, WalCommand};

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_price(price_monthly: Decimal) -> Result<(), EngineError> {
    if price_monthly.is_sign_negative() {
        return Err(EngineError::LimitExceeded("price must not be negative"));
    }
    if price_monthly > Decimal::from(MAX_PRICE_MONTHLY) {
        return Err(EngineError::LimitExceeded("price too large"));
    }
    Ok(())
}

fn check_new_entity(engine: &Engine, id: Ulid) -> Result<(), EngineError> {
    if engine.entity_to_billboard.contains_key(&id) {
        return Err(EngineError::AlreadyExists(id));
    }
    Ok(())
}

fn check_policy(policy: &BillboardPolicy) -> Result<(), EngineError> {
    check_price(policy.base_price_monthly)?;
    if let Some(r) = &policy.pause_reason {
        check_len(r, MAX_REASON_LEN, "pause reason too long")?;
    }
    Ok(())
}

fn require_owner(st: &BillboardState, actor: Ulid, entity: Ulid) -> Result<(), EngineError> {
    if st.is_owner(actor) {
        Ok(())
    } else {
        Err(EngineError::Permission { actor, entity })
    }
}

fn notice(st: &BillboardState, booking: &Booking, reason: Option<String>) -> BookingNotice {
    BookingNotice {
        booking_id: booking.id,
        billboard_id: st.id(),
        owner_id: st.billboard.owner_id,
        requester_id: booking.requester_id,
        range: booking.range,
        reason,
    }
}

impl Engine {
    // ── Billboards ───────────────────────────────────────────

    pub async fn create_billboard(
        &self,
        id: Ulid,
        owner_id: Ulid,
        is_digital: bool,
        policy: BillboardPolicy,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_BILLBOARDS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many billboards"));
        }
        check_policy(&policy)?;
        if self.state.contains_key(&id) || self.entity_to_billboard.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::BillboardCreated {
            id,
            owner_id,
            is_digital,
            policy: policy.clone(),
        };
        self.wal_append(&event).await?;
        let st = BillboardState::new(Billboard { id, owner_id, is_digital, policy });
        self.state.insert(id, Arc::new(RwLock::new(st)));
        self.notify.send(id, &event);
        debug!("billboard {id} created (digital: {is_digital})");
        Ok(())
    }

    /// Replace the owner-controlled policy. Digital-ness is fixed at creation.
    pub async fn update_billboard(
        &self,
        id: Ulid,
        actor: Ulid,
        policy: BillboardPolicy,
    ) -> Result<(), EngineError> {
        check_policy(&policy)?;
        let mut guard = self.write_billboard(id).await?;
        require_owner(&guard, actor, id)?;
        let event = Event::BillboardUpdated { id, policy };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Booking state machine ────────────────────────────────

    /// Create a Pending booking. Policy violations are returned all at once;
    /// overlapping other bookings is allowed at this stage.
    pub async fn submit_booking(
        &self,
        id: Ulid,
        billboard_id: Ulid,
        requester_id: Ulid,
        range: DateRange,
        note: String,
        attachments: Vec<String>,
    ) -> Result<Booking, EngineError> {
        check_len(&note, MAX_NOTE_LEN, "note too long")?;
        if attachments.len() > MAX_ATTACHMENTS {
            return Err(EngineError::LimitExceeded("too many attachments"));
        }
        for a in &attachments {
            check_len(a, MAX_ATTACHMENT_REF_LEN, "attachment reference too long")?;
        }
        check_new_entity(self, id)?;

        let mut guard = self.write_billboard(billboard_id).await?;
        // Another submit with this id may have committed while we waited.
        check_new_entity(self, id)?;
        let violations = validate_booking(&guard.billboard, &range, self.today());
        if !violations.is_empty() {
            metrics::counter!(observability::VALIDATION_REJECTIONS_TOTAL).increment(1);
            return Err(EngineError::Invalid(violations));
        }
        validate_range(&range)?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_BILLBOARD {
            return Err(EngineError::LimitExceeded("too many bookings on billboard"));
        }

        let booking = Booking {
            id,
            billboard_id,
            requester_id,
            range,
            status: BookingStatus::Pending,
            total_price: quote(&guard, &range),
            note,
            attachments,
            rejection_reason: None,
            created_at: Utc::now(),
        };
        let event = Event::BookingSubmitted { booking: booking.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        dispatch(&self.options.notifier, NoticeKind::Submitted, notice(&guard, &booking, None));
        Ok(booking)
    }

    /// Pending → Approved, as one critical section: the conflict check and the
    /// ledger write happen under the billboard's write lock, so two approvals
    /// of overlapping bookings can never both pass the check.
    pub async fn approve_booking(&self, id: Ulid, actor: Ulid) -> Result<ApproveOutcome, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?.clone();
        require_owner(&guard, actor, id)?;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id,
                from: booking.status,
                action: "approve",
            });
        }

        if let Some(conflict) = find_conflict(&guard, &booking.range, Some(id)) {
            metrics::counter!(observability::APPROVALS_TOTAL, "outcome" => "conflict").increment(1);
            info!(
                "approval of {id} refused: {} overlaps {} {}",
                booking.range,
                conflict.kind.as_str(),
                conflict.id
            );
            return Ok(ApproveOutcome::Conflict(conflict));
        }

        let block_id = (!guard.billboard.is_digital).then(Ulid::new);
        let event = Event::BookingApproved {
            id,
            billboard_id: guard.id(),
            block_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::APPROVALS_TOTAL, "outcome" => "approved").increment(1);
        info!("booking {id} approved for {}", booking.range);
        dispatch(&self.options.notifier, NoticeKind::Approved, notice(&guard, &booking, None));
        Ok(ApproveOutcome::Approved { block_id })
    }

    /// Pending → Rejected. Pending bookings never hold blocks, so the ledger is untouched.
    pub async fn reject_booking(
        &self,
        id: Ulid,
        actor: Ulid,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some(r) = &reason {
            check_len(r, MAX_REASON_LEN, "reason too long")?;
        }
        let mut guard = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?.clone();
        require_owner(&guard, actor, id)?;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id,
                from: booking.status,
                action: "reject",
            });
        }

        let event = Event::BookingRejected {
            id,
            billboard_id: guard.id(),
            reason: reason.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        dispatch(&self.options.notifier, NoticeKind::Rejected, notice(&guard, &booking, reason));
        Ok(())
    }

    /// Pending → Cancelled (requester), Approved → Cancelled (requester or owner).
    ///
    /// Returns the implicit blocks released with the cancellation, which is
    /// always empty unless `reclaim_blocks_on_cancel` is set.
    pub async fn cancel_booking(&self, id: Ulid, actor: Ulid) -> Result<Vec<Ulid>, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?.clone();

        let is_requester = booking.requester_id == actor;
        let allowed = match booking.status {
            BookingStatus::Pending => is_requester,
            _ => is_requester || guard.is_owner(actor),
        };
        if !allowed {
            return Err(EngineError::Permission { actor, entity: id });
        }
        if booking.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id,
                from: booking.status,
                action: "cancel",
            });
        }

        let released_blocks: Vec<Ulid> = if self.options.reclaim_blocks_on_cancel {
            guard.blocks_for_booking(id).map(|b| b.id).collect()
        } else {
            Vec::new()
        };
        let event = Event::BookingCancelled {
            id,
            billboard_id: guard.id(),
            released_blocks: released_blocks.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        if !released_blocks.is_empty() {
            info!("cancelled booking {id} released {} blocks", released_blocks.len());
        }
        dispatch(&self.options.notifier, NoticeKind::Cancelled, notice(&guard, &booking, None));
        Ok(released_blocks)
    }

    // ── Blocked-date ledger ──────────────────────────────────

    /// Owner-authored block. On physical billboards it may not overlap
    /// committed occupancy.
    pub async fn add_block(
        &self,
        id: Ulid,
        billboard_id: Ulid,
        actor: Ulid,
        range: DateRange,
        reason: String,
    ) -> Result<(), EngineError> {
        validate_range(&range)?;
        check_len(&reason, MAX_REASON_LEN, "reason too long")?;
        check_new_entity(self, id)?;
        let mut guard = self.write_billboard(billboard_id).await?;
        check_new_entity(self, id)?;
        require_owner(&guard, actor, billboard_id)?;
        if guard.blocks.len() >= MAX_BLOCKS_PER_BILLBOARD {
            return Err(EngineError::LimitExceeded("too many blocks on billboard"));
        }
        if let Some(conflict) = find_conflict(&guard, &range, None) {
            return Err(EngineError::Conflict(conflict.id));
        }

        let event = Event::BlockAdded {
            block: BlockedDateRange {
                id,
                billboard_id,
                range,
                origin: BlockOrigin::Owner { reason },
            },
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Remove any ledger entry, explicit or approval-derived. Owner only.
    pub async fn remove_block(&self, id: Ulid, actor: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        if !guard.blocks.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }
        require_owner(&guard, actor, id)?;
        let billboard_id = guard.id();
        let event = Event::BlockRemoved { id, billboard_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(billboard_id)
    }

    /// Reclaim the implicit blocks left behind by a cancelled approval.
    pub async fn release_booking_blocks(&self, booking_id: Ulid, actor: Ulid) -> Result<Vec<Ulid>, EngineError> {
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let status = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?
            .status;
        require_owner(&guard, actor, booking_id)?;
        if status != BookingStatus::Cancelled {
            return Err(EngineError::InvalidTransition {
                id: booking_id,
                from: status,
                action: "release blocks of",
            });
        }

        let billboard_id = guard.id();
        let ids: Vec<Ulid> = guard.blocks_for_booking(booking_id).map(|b| b.id).collect();
        for id in &ids {
            let event = Event::BlockRemoved { id: *id, billboard_id };
            self.persist_and_apply(&mut guard, &event).await?;
        }
        if !ids.is_empty() {
            info!("released {} blocks of cancelled booking {booking_id}", ids.len());
        }
        Ok(ids)
    }

    // ── Pricing overrides ────────────────────────────────────

    pub async fn add_pricing_override(
        &self,
        id: Ulid,
        billboard_id: Ulid,
        actor: Ulid,
        range: DateRange,
        price_monthly: Decimal,
        note: Option<String>,
    ) -> Result<(), EngineError> {
        validate_range(&range)?;
        check_price(price_monthly)?;
        if let Some(n) = &note {
            check_len(n, MAX_NOTE_LEN, "note too long")?;
        }
        check_new_entity(self, id)?;
        let mut guard = self.write_billboard(billboard_id).await?;
        check_new_entity(self, id)?;
        require_owner(&guard, actor, billboard_id)?;
        if guard.overrides.len() >= MAX_OVERRIDES_PER_BILLBOARD {
            return Err(EngineError::LimitExceeded("too many pricing overrides on billboard"));
        }

        let event = Event::OverrideAdded {
            pricing: PricingOverride {
                id,
                billboard_id,
                range,
                price_monthly,
                note,
                created_at: Utc::now(),
            },
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_pricing_override(&self, id: Ulid, actor: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        if !guard.overrides.iter().any(|o| o.id == id) {
            return Err(EngineError::NotFound(id));
        }
        require_owner(&guard, actor, id)?;
        let billboard_id = guard.id();
        let event = Event::OverrideRemoved { id, billboard_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(billboard_id)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
