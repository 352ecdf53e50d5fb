use chrono::{Days, NaiveDate};

use crate::model::*;

use super::Violation;

/// Check a requested range against the billboard's booking policy.
///
/// Every rule is evaluated; the returned list is empty when the request is
/// acceptable. Passing says nothing about conflicts with other bookings.
pub fn validate_booking(billboard: &Billboard, range: &DateRange, today: NaiveDate) -> Vec<Violation> {
    let policy = &billboard.policy;
    let mut violations = Vec::new();

    if !range.is_chronological() {
        violations.push(Violation::Chronology);
    }

    let earliest = today
        .checked_add_days(Days::new(u64::from(policy.min_advance_booking_days)))
        .unwrap_or(NaiveDate::MAX);
    if range.start < earliest {
        violations.push(Violation::AdvanceNotice { earliest });
    }

    if policy.min_campaign_days > 0 && range.days() < i64::from(policy.min_campaign_days) {
        violations.push(Violation::MinDuration {
            days: range.days(),
            required: policy.min_campaign_days,
        });
    }

    if !policy.accepts_bookings() {
        violations.push(Violation::Unavailable {
            reason: policy.pause_reason.clone(),
        });
    }

    violations
}
