use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Inclusive calendar range `[start, end]`.
///
/// Well-formed ranges have `start < end`; the validator reports anything else
/// instead of the constructor rejecting it, so callers can show every problem
/// with a submission at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn is_chronological(&self) -> bool {
        self.end > self.start
    }

    /// `end - start` in whole days. Negative for reversed ranges.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Every date in the range, both ends included.
    pub fn iter_days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Owner-controlled booking policy. Everything here may change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillboardPolicy {
    pub base_price_monthly: Decimal,
    /// Minimum `end - start` in days. 0 disables the check.
    pub min_campaign_days: u32,
    pub min_advance_booking_days: u32,
    pub is_available: bool,
    pub pause_reason: Option<String>,
}

impl BillboardPolicy {
    pub fn new(base_price_monthly: Decimal) -> Self {
        Self {
            base_price_monthly,
            min_campaign_days: 0,
            min_advance_booking_days: 0,
            is_available: true,
            pause_reason: None,
        }
    }

    pub fn accepts_bookings(&self) -> bool {
        self.is_available && self.pause_reason.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Billboard {
    pub id: Ulid,
    pub owner_id: Ulid,
    /// Digital displays rotate content and are exempt from occupancy exclusivity.
    pub is_digital: bool,
    pub policy: BillboardPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Rejected | BookingStatus::Cancelled)
    }

    /// Pending and Approved bookings still claim their dates on the calendar.
    pub fn is_live(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Approved)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-side interpretation of a booking relative to today. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingPhase {
    Pending,
    Upcoming,
    Active,
    Completed,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub billboard_id: Ulid,
    pub requester_id: Ulid,
    pub range: DateRange,
    pub status: BookingStatus,
    pub total_price: Decimal,
    pub note: String,
    pub attachments: Vec<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    pub fn phase(&self, today: NaiveDate) -> BookingPhase {
        match self.status {
            BookingStatus::Pending => BookingPhase::Pending,
            BookingStatus::Rejected => BookingPhase::Rejected,
            BookingStatus::Cancelled => BookingPhase::Cancelled,
            BookingStatus::Approved if today < self.range.start => BookingPhase::Upcoming,
            BookingStatus::Approved if today > self.range.end => BookingPhase::Completed,
            BookingStatus::Approved => BookingPhase::Active,
        }
    }
}

/// Where a ledger entry came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockOrigin {
    /// Authored by the owner (maintenance, private use, ...).
    Owner { reason: String },
    /// Written by the approval of this booking.
    Booking { booking_id: Ulid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedDateRange {
    pub id: Ulid,
    pub billboard_id: Ulid,
    pub range: DateRange,
    pub origin: BlockOrigin,
}

impl BlockedDateRange {
    pub fn reason(&self) -> String {
        match &self.origin {
            BlockOrigin::Owner { reason } => reason.clone(),
            BlockOrigin::Booking { booking_id } => format!("booking:{booking_id}"),
        }
    }

    pub fn booking_id(&self) -> Option<Ulid> {
        match self.origin {
            BlockOrigin::Booking { booking_id } => Some(booking_id),
            BlockOrigin::Owner { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingOverride {
    pub id: Ulid,
    pub billboard_id: Ulid,
    pub range: DateRange,
    pub price_monthly: Decimal,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything the engine knows about one billboard. One lock guards all of it.
#[derive(Debug, Clone)]
pub struct BillboardState {
    pub billboard: Billboard,
    /// Sorted by `range.start`.
    pub bookings: Vec<Booking>,
    /// Sorted by `range.start`.
    pub blocks: Vec<BlockedDateRange>,
    /// Creation order; later entries win when ranges overlap.
    pub overrides: Vec<PricingOverride>,
}

impl BillboardState {
    pub fn new(billboard: Billboard) -> Self {
        Self {
            billboard,
            bookings: Vec::new(),
            blocks: Vec::new(),
            overrides: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.billboard.id
    }

    pub fn is_owner(&self, actor: Ulid) -> bool {
        self.billboard.owner_id == actor
    }

    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.range.start <= booking.range.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn insert_block(&mut self, block: BlockedDateRange) {
        let pos = self
            .blocks
            .partition_point(|b| b.range.start <= block.range.start);
        self.blocks.insert(pos, block);
    }

    pub fn remove_block(&mut self, id: Ulid) -> Option<BlockedDateRange> {
        let pos = self.blocks.iter().position(|b| b.id == id)?;
        Some(self.blocks.remove(pos))
    }

    pub fn remove_override(&mut self, id: Ulid) -> Option<PricingOverride> {
        let pos = self.overrides.iter().position(|o| o.id == id)?;
        Some(self.overrides.remove(pos))
    }

    /// Bookings whose range overlaps `query`, any status.
    /// Binary search skips everything starting after `query.end`.
    pub fn bookings_overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.range.start <= query.end);
        let start = query.start;
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.range.end >= start)
    }

    pub fn blocks_overlapping(&self, query: &DateRange) -> impl Iterator<Item = &BlockedDateRange> {
        let right_bound = self.blocks.partition_point(|b| b.range.start <= query.end);
        let start = query.start;
        self.blocks[..right_bound]
            .iter()
            .filter(move |b| b.range.end >= start)
    }

    /// Implicit ledger entries written on behalf of `booking_id`.
    pub fn blocks_for_booking(&self, booking_id: Ulid) -> impl Iterator<Item = &BlockedDateRange> {
        self.blocks
            .iter()
            .filter(move |b| b.booking_id() == Some(booking_id))
    }
}

/// The event types: flat, no nesting beyond the entity payloads. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BillboardCreated {
        id: Ulid,
        owner_id: Ulid,
        is_digital: bool,
        policy: BillboardPolicy,
    },
    BillboardUpdated {
        id: Ulid,
        policy: BillboardPolicy,
    },
    /// Normally carries a Pending booking. Compaction re-emits bookings in
    /// whatever status they ended up in.
    BookingSubmitted {
        booking: Booking,
    },
    BookingApproved {
        id: Ulid,
        billboard_id: Ulid,
        /// Implicit ledger entry; `None` for digital billboards.
        block_id: Option<Ulid>,
    },
    BookingRejected {
        id: Ulid,
        billboard_id: Ulid,
        reason: Option<String>,
    },
    BookingCancelled {
        id: Ulid,
        billboard_id: Ulid,
        /// Implicit blocks reclaimed together with the cancellation.
        released_blocks: Vec<Ulid>,
    },
    BlockAdded {
        block: BlockedDateRange,
    },
    BlockRemoved {
        id: Ulid,
        billboard_id: Ulid,
    },
    OverrideAdded {
        pricing: PricingOverride,
    },
    OverrideRemoved {
        id: Ulid,
        billboard_id: Ulid,
    },
}

impl Event {
    pub fn billboard_id(&self) -> Ulid {
        match self {
            Event::BillboardCreated { id, .. } | Event::BillboardUpdated { id, .. } => *id,
            Event::BookingSubmitted { booking } => booking.billboard_id,
            Event::BookingApproved { billboard_id, .. }
            | Event::BookingRejected { billboard_id, .. }
            | Event::BookingCancelled { billboard_id, .. }
            | Event::BlockRemoved { billboard_id, .. }
            | Event::OverrideRemoved { billboard_id, .. } => *billboard_id,
            Event::BlockAdded { block } => block.billboard_id,
            Event::OverrideAdded { pricing } => pricing.billboard_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Per-day projection. Variants are listed in precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayStatus {
    Blocked { block_id: Ulid },
    Booked { booking_id: Ulid, status: BookingStatus },
    Priced(Decimal),
    Default(Decimal),
}

impl DayStatus {
    pub fn label(&self) -> &'static str {
        match self {
            DayStatus::Blocked { .. } => "blocked",
            DayStatus::Booked { .. } => "booked",
            DayStatus::Priced(_) => "priced",
            DayStatus::Default(_) => "default",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    Block,
    ApprovedBooking,
    /// Competing request; never blocks approval on its own.
    PendingBooking,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::Block => "block",
            ConflictKind::ApprovedBooking => "approved_booking",
            ConflictKind::PendingBooking => "pending_booking",
        }
    }

    pub fn is_blocking(&self) -> bool {
        !matches!(self, ConflictKind::PendingBooking)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub id: Ulid,
    pub kind: ConflictKind,
    pub range: DateRange,
}

/// Result of an approval attempt. A conflict is a normal business outcome:
/// the booking stays Pending and the owner picks what to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApproveOutcome {
    Approved { block_id: Option<Ulid> },
    Conflict(ConflictInfo),
}

impl ApproveOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApproveOutcome::Approved { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn range(a: &str, b: &str) -> DateRange {
        DateRange::new(d(a), d(b))
    }

    fn billboard() -> Billboard {
        Billboard {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            is_digital: false,
            policy: BillboardPolicy::new(Decimal::from(30_000)),
        }
    }

    fn booking_in(billboard_id: Ulid, r: DateRange, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            billboard_id,
            requester_id: Ulid::new(),
            range: r,
            status,
            total_price: Decimal::ZERO,
            note: String::new(),
            attachments: Vec::new(),
            rejection_reason: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn range_basics() {
        let r = range("2024-03-01", "2024-03-31");
        assert!(r.is_chronological());
        assert_eq!(r.days(), 30);
        assert!(r.contains_date(d("2024-03-01")));
        assert!(r.contains_date(d("2024-03-31"))); // inclusive
        assert!(!r.contains_date(d("2024-04-01")));
        assert_eq!(r.iter_days().count(), 31);
    }

    #[test]
    fn range_reversed_is_not_chronological() {
        let r = range("2024-03-10", "2024-03-01");
        assert!(!r.is_chronological());
        assert_eq!(r.days(), -9);
        assert!(!range("2024-03-01", "2024-03-01").is_chronological());
    }

    #[test]
    fn range_overlap_is_inclusive() {
        let a = range("2024-03-01", "2024-03-31");
        let touching = range("2024-03-31", "2024-04-10");
        let after = range("2024-04-01", "2024-04-10");
        assert!(a.overlaps(&touching)); // shared last day
        assert!(touching.overlaps(&a));
        assert!(!a.overlaps(&after));
    }

    #[test]
    fn bookings_stay_sorted() {
        let mut st = BillboardState::new(billboard());
        let bid = st.id();
        for (a, b) in [
            ("2024-05-01", "2024-05-10"),
            ("2024-01-01", "2024-01-10"),
            ("2024-03-01", "2024-03-10"),
        ] {
            st.insert_booking(booking_in(bid, range(a, b), BookingStatus::Pending));
        }
        let starts: Vec<_> = st.bookings.iter().map(|b| b.range.start).collect();
        assert_eq!(starts, vec![d("2024-01-01"), d("2024-03-01"), d("2024-05-01")]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut st = BillboardState::new(billboard());
        let bid = st.id();
        st.insert_booking(booking_in(bid, range("2024-01-01", "2024-01-31"), BookingStatus::Approved));
        st.insert_booking(booking_in(bid, range("2024-03-01", "2024-03-31"), BookingStatus::Pending));
        st.insert_booking(booking_in(bid, range("2024-06-01", "2024-06-30"), BookingStatus::Pending));

        let hits: Vec<_> = st
            .bookings_overlapping(&range("2024-02-15", "2024-03-01"))
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].range.start, d("2024-03-01"));
    }

    #[test]
    fn blocks_for_booking_follows_back_reference() {
        let mut st = BillboardState::new(billboard());
        let bid = st.id();
        let booking_id = Ulid::new();
        st.insert_block(BlockedDateRange {
            id: Ulid::new(),
            billboard_id: bid,
            range: range("2024-03-01", "2024-03-31"),
            origin: BlockOrigin::Booking { booking_id },
        });
        st.insert_block(BlockedDateRange {
            id: Ulid::new(),
            billboard_id: bid,
            range: range("2024-05-01", "2024-05-03"),
            origin: BlockOrigin::Owner { reason: "maintenance".into() },
        });
        let found: Vec<_> = st.blocks_for_booking(booking_id).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].reason(), format!("booking:{booking_id}"));
    }

    #[test]
    fn remove_missing_block_returns_none() {
        let mut st = BillboardState::new(billboard());
        assert!(st.remove_block(Ulid::new()).is_none());
        assert!(st.remove_override(Ulid::new()).is_none());
    }

    #[test]
    fn booking_phase_from_today() {
        let bb = billboard();
        let mut b = booking_in(bb.id, range("2024-03-01", "2024-03-31"), BookingStatus::Approved);
        assert_eq!(b.phase(d("2024-02-01")), BookingPhase::Upcoming);
        assert_eq!(b.phase(d("2024-03-31")), BookingPhase::Active);
        assert_eq!(b.phase(d("2024-04-01")), BookingPhase::Completed);
        b.status = BookingStatus::Cancelled;
        assert_eq!(b.phase(d("2024-03-15")), BookingPhase::Cancelled);
    }

    #[test]
    fn policy_pause_reason_stops_bookings() {
        let mut p = BillboardPolicy::new(Decimal::ONE);
        assert!(p.accepts_bookings());
        p.pause_reason = Some("repainting".into());
        assert!(!p.accepts_bookings());
        p.pause_reason = None;
        p.is_available = false;
        assert!(!p.accepts_bookings());
    }

    #[test]
    fn event_bincode_roundtrip() {
        let bb = billboard();
        let event = Event::BookingSubmitted {
            booking: booking_in(bb.id, range("2024-03-01", "2024-03-31"), BookingStatus::Pending),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
        assert_eq!(decoded.billboard_id(), bb.id);
    }
}
