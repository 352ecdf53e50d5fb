use chrono::Datelike;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Structural sanity for any range the engine stores: ordered, within sane
/// years, not absurdly long. Policy checks live in `validate`.
pub(crate) fn validate_range(range: &DateRange) -> Result<(), EngineError> {
    use crate::limits::*;
    if !range.is_chronological() {
        return Err(EngineError::Invalid(vec![super::Violation::Chronology]));
    }
    if range.start.year() < MIN_VALID_YEAR || range.end.year() > MAX_VALID_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if range.days() > MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("range too long"));
    }
    Ok(())
}

/// First committed entry that `candidate` would collide with, if any.
///
/// Digital billboards never conflict. Otherwise blocks are checked before
/// approved bookings; `exclude` skips a booking when re-checking it against
/// itself.
pub(crate) fn find_conflict(
    st: &BillboardState,
    candidate: &DateRange,
    exclude: Option<Ulid>,
) -> Option<ConflictInfo> {
    if st.billboard.is_digital {
        return None;
    }
    if let Some(block) = st.blocks_overlapping(candidate).next() {
        return Some(ConflictInfo {
            id: block.id,
            kind: ConflictKind::Block,
            range: block.range,
        });
    }
    st.bookings_overlapping(candidate)
        .find(|b| b.status == BookingStatus::Approved && Some(b.id) != exclude)
        .map(|b| ConflictInfo {
            id: b.id,
            kind: ConflictKind::ApprovedBooking,
            range: b.range,
        })
}

pub fn has_conflict(st: &BillboardState, candidate: &DateRange, exclude: Option<Ulid>) -> bool {
    find_conflict(st, candidate, exclude).is_some()
}

/// Every entry overlapping `candidate`: blocks and approved bookings (blocking)
/// followed by pending requests competing for the same dates (advisory).
pub fn list_conflicts(st: &BillboardState, candidate: &DateRange) -> Vec<ConflictInfo> {
    if st.billboard.is_digital {
        return Vec::new();
    }
    let mut out: Vec<ConflictInfo> = st
        .blocks_overlapping(candidate)
        .map(|b| ConflictInfo {
            id: b.id,
            kind: ConflictKind::Block,
            range: b.range,
        })
        .collect();
    let mut pending = Vec::new();
    for b in st.bookings_overlapping(candidate) {
        let kind = match b.status {
            BookingStatus::Approved => ConflictKind::ApprovedBooking,
            BookingStatus::Pending => ConflictKind::PendingBooking,
            _ => continue,
        };
        let info = ConflictInfo { id: b.id, kind, range: b.range };
        if kind.is_blocking() {
            out.push(info);
        } else {
            pending.push(info);
        }
    }
    out.extend(pending);
    out
}
