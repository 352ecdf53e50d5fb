//! Hard caps that keep a single tenant from exhausting memory or the WAL.

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_BILLBOARDS_PER_TENANT: usize = 100_000;
pub const MAX_BOOKINGS_PER_BILLBOARD: usize = 10_000;
pub const MAX_BLOCKS_PER_BILLBOARD: usize = 10_000;
pub const MAX_OVERRIDES_PER_BILLBOARD: usize = 1_000;

pub const MAX_NOTE_LEN: usize = 4_096;
pub const MAX_REASON_LEN: usize = 1_024;
pub const MAX_ATTACHMENTS: usize = 16;
pub const MAX_ATTACHMENT_REF_LEN: usize = 512;

/// Highest monthly rate a policy or override may carry. Keeps proration
/// of the longest allowed range well inside `Decimal`'s range.
pub const MAX_PRICE_MONTHLY: i64 = 1_000_000_000;

/// Longest bookable or blockable range, in days.
pub const MAX_RANGE_DAYS: i64 = 3_660;
/// Widest window a single calendar projection may cover.
pub const MAX_CALENDAR_DAYS: i64 = 1_100;

/// Dates outside these years are rejected as garbage input.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2200;
