use chrono::NaiveDate;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{find_conflict, validate_range};
use super::{calendar, day_status, list_conflicts, price_for, quote};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_billboard(&self, id: Ulid) -> Result<Billboard, EngineError> {
        let guard = self.read_billboard(id).await?;
        Ok(guard.billboard.clone())
    }

    /// Every billboard in this engine, ordered by id.
    pub async fn list_billboards(&self) -> Vec<Billboard> {
        // Collect the Arcs first: holding DashMap shard guards across an await deadlocks.
        let states: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for st in states {
            out.push(st.read().await.billboard.clone());
        }
        out.sort_by_key(|b| b.id);
        out
    }

    pub async fn get_bookings(&self, billboard_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let guard = self.read_billboard(billboard_id).await?;
        Ok(guard.bookings.clone())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let billboard_id = self
            .get_billboard_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = self.read_billboard(billboard_id).await?;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn booking_phase(&self, id: Ulid) -> Result<BookingPhase, EngineError> {
        let booking = self.get_booking(id).await?;
        Ok(booking.phase(self.today()))
    }

    pub async fn get_blocks(&self, billboard_id: Ulid) -> Result<Vec<BlockedDateRange>, EngineError> {
        let guard = self.read_billboard(billboard_id).await?;
        Ok(guard.blocks.clone())
    }

    /// Implicit blocks written by approving `booking_id`.
    pub async fn blocks_for_booking(&self, booking_id: Ulid) -> Result<Vec<BlockedDateRange>, EngineError> {
        let billboard_id = self
            .get_billboard_for_entity(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let guard = self.read_billboard(billboard_id).await?;
        Ok(guard.blocks_for_booking(booking_id).cloned().collect())
    }

    /// Overrides in creation order.
    pub async fn get_overrides(&self, billboard_id: Ulid) -> Result<Vec<PricingOverride>, EngineError> {
        let guard = self.read_billboard(billboard_id).await?;
        Ok(guard.overrides.clone())
    }

    pub async fn price_for_date(&self, billboard_id: Ulid, date: NaiveDate) -> Result<Decimal, EngineError> {
        let guard = self.read_billboard(billboard_id).await?;
        Ok(price_for(&guard, date))
    }

    /// What `submit_booking` would charge for `range` right now.
    pub async fn quote_range(&self, billboard_id: Ulid, range: DateRange) -> Result<Decimal, EngineError> {
        validate_range(&range)?;
        let guard = self.read_billboard(billboard_id).await?;
        Ok(quote(&guard, &range))
    }

    /// The monthly rate on `range.start` and the total it yields, read under one lock.
    pub async fn quote_with_rate(
        &self,
        billboard_id: Ulid,
        range: DateRange,
    ) -> Result<(Decimal, Decimal), EngineError> {
        validate_range(&range)?;
        let guard = self.read_billboard(billboard_id).await?;
        Ok((price_for(&guard, range.start), quote(&guard, &range)))
    }

    /// Advisory pre-check. Approval re-runs the same check under the write lock.
    pub async fn check_conflict(
        &self,
        billboard_id: Ulid,
        range: DateRange,
    ) -> Result<Option<ConflictInfo>, EngineError> {
        validate_range(&range)?;
        let guard = self.read_billboard(billboard_id).await?;
        Ok(find_conflict(&guard, &range, None))
    }

    pub async fn has_conflict(&self, billboard_id: Ulid, range: DateRange) -> Result<bool, EngineError> {
        Ok(self.check_conflict(billboard_id, range).await?.is_some())
    }

    pub async fn list_conflicts(
        &self,
        billboard_id: Ulid,
        range: DateRange,
    ) -> Result<Vec<ConflictInfo>, EngineError> {
        validate_range(&range)?;
        let guard = self.read_billboard(billboard_id).await?;
        Ok(list_conflicts(&guard, &range))
    }

    pub async fn day_status(&self, billboard_id: Ulid, date: NaiveDate) -> Result<DayStatus, EngineError> {
        let guard = self.read_billboard(billboard_id).await?;
        Ok(day_status(&guard, date))
    }

    pub async fn calendar(
        &self,
        billboard_id: Ulid,
        range: DateRange,
    ) -> Result<Vec<(NaiveDate, DayStatus)>, EngineError> {
        if range.end < range.start {
            return Err(EngineError::Invalid(vec![super::Violation::Chronology]));
        }
        if range.days() + 1 > MAX_CALENDAR_DAYS {
            return Err(EngineError::LimitExceeded("calendar window too wide"));
        }
        let guard = self.read_billboard(billboard_id).await?;
        Ok(calendar(&guard, &range))
    }
}
