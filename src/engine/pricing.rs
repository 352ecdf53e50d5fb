use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::model::*;

/// Days in the notional month used for proration.
const DAYS_PER_MONTH: i64 = 30;

/// The override in effect on `date`, if any. Last created wins.
pub fn override_for(st: &BillboardState, date: NaiveDate) -> Option<&PricingOverride> {
    st.overrides.iter().rev().find(|o| o.range.contains_date(date))
}

/// Effective monthly rate on `date`.
pub fn price_for(st: &BillboardState, date: NaiveDate) -> Decimal {
    override_for(st, date)
        .map(|o| o.price_monthly)
        .unwrap_or(st.billboard.policy.base_price_monthly)
}

/// `monthly × days / 30`, rounded half away from zero to cents.
pub fn prorate(price_monthly: Decimal, days: i64) -> Decimal {
    (price_monthly * Decimal::from(days) / Decimal::from(DAYS_PER_MONTH))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Total for a booking over `range`, using the single rate in effect on its
/// first day. Rate changes inside the range are not prorated.
pub fn quote(st: &BillboardState, range: &DateRange) -> Decimal {
    prorate(price_for(st, range.start), range.days().max(0))
}
