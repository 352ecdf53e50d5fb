use chrono::NaiveDate;

use crate::model::*;

use super::pricing::override_for;

/// Project one day of a billboard's calendar.
///
/// Precedence: blocked, then booked (approved before pending, then earliest
/// submitted), then priced by an override, then the base rate.
pub fn day_status(st: &BillboardState, date: NaiveDate) -> DayStatus {
    let day = DateRange::new(date, date);

    if let Some(block) = st.blocks_overlapping(&day).next() {
        return DayStatus::Blocked { block_id: block.id };
    }

    let booked = st
        .bookings_overlapping(&day)
        .filter(|b| b.status.is_live())
        .min_by_key(|b| (b.status != BookingStatus::Approved, b.created_at, b.id));
    if let Some(b) = booked {
        return DayStatus::Booked {
            booking_id: b.id,
            status: b.status,
        };
    }

    match override_for(st, date) {
        Some(o) => DayStatus::Priced(o.price_monthly),
        None => DayStatus::Default(st.billboard.policy.base_price_monthly),
    }
}

/// `day_status` for every date of `range`, in order.
pub fn calendar(st: &BillboardState, range: &DateRange) -> Vec<(NaiveDate, DayStatus)> {
    range.iter_days().map(|d| (d, day_status(st, d))).collect()
}
