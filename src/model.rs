use std::fmt;

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for created/updated stamps.
pub type Ms = i64;

/// Integer currency units. Prices are never fractional.
pub type Money = i64;

/// Catalog slot ordinal. Slots are ordered by start time, so ordinals double
/// as the adjacency key when merging booked blocks.
pub type SlotId = u32;

/// Half-open time-of-day range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    /// Fallible constructor for untrusted input.
    pub fn checked(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other` (equal bounds included).
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Both bounds fall on a multiple of `unit_minutes` past midnight.
    pub fn is_aligned(&self, unit_minutes: u32) -> bool {
        let unit = unit_minutes.max(1);
        let on_grid = |t: NaiveTime| t.second() == 0 && (t.hour() * 60 + t.minute()) % unit == 0;
        on_grid(self.start) && on_grid(self.end)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DayType {
    Weekday,
    Weekend,
}

impl DayType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DayType::Weekday => "WEEKDAY",
            DayType::Weekend => "WEEKEND",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "WEEKDAY" => Some(DayType::Weekday),
            "WEEKEND" => Some(DayType::Weekend),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    /// Awaiting external payment confirmation. Reclaimed by the sweeper.
    Paying,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn is_active(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Paying => "PAYING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Completed => "COMPLETED",
        }
    }

    /// Whether the booking state machine allows moving from `self` to `next`.
    pub fn can_become(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Paying, Confirmed) | (Paying, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleStatus {
    Active,
    Cancelled,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Active => "ACTIVE",
            RuleStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Set of weekdays in the canonical `0 = Sunday .. 6 = Saturday` encoding,
/// stored as a bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const EMPTY: WeekdaySet = WeekdaySet(0);

    /// Build from canonical day numbers. Returns the first out-of-range value on error.
    pub fn from_canonical(days: &[u8]) -> Result<Self, u8> {
        let mut bits = 0u8;
        for &d in days {
            if d > 6 {
                return Err(d);
            }
            bits |= 1 << d;
        }
        Ok(WeekdaySet(bits))
    }

    pub fn contains(&self, canonical_day: u8) -> bool {
        canonical_day <= 6 && self.0 & (1 << canonical_day) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn days(&self) -> Vec<u8> {
        (0..=6).filter(|d| self.contains(*d)).collect()
    }
}

impl fmt::Display for WeekdaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days: Vec<String> = self.days().iter().map(|d| d.to_string()).collect();
        f.write_str(&days.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub district: String,
    pub province: String,
}

impl Address {
    /// Denormalized single-line form copied onto every booking.
    pub fn snapshot(&self) -> String {
        [&self.street, &self.district, &self.province]
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| part.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourtGroup {
    pub id: Ulid,
    pub name: String,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Court {
    pub id: Ulid,
    pub group_id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: SlotId,
    pub range: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRow {
    pub id: Ulid,
    pub group_id: Ulid,
    /// Court-specific override. `None` applies to every court of the group.
    pub court_id: Option<Ulid>,
    pub slot_id: SlotId,
    pub day_type: DayType,
    /// Price per granularity unit (30 minutes by default).
    pub unit_price: Money,
    pub effective_from: NaiveDate,
    /// Insertion order, breaks ties between equal effective dates.
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// Identity shared by every row of one reservation.
    pub reservation_id: Ulid,
    pub rule_id: Option<Ulid>,
    pub user_id: String,
    pub court_id: Ulid,
    pub slot_id: SlotId,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub status: BookingStatus,
    pub price: Money,
    pub address: String,
    pub payment_ref: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringRule {
    pub id: Ulid,
    pub user_id: String,
    pub court_id: Ulid,
    pub start_date: NaiveDate,
    /// Inclusive.
    pub end_date: NaiveDate,
    pub weekdays: WeekdaySet,
    pub range: TimeRange,
    pub status: RuleStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// The event types. This is the WAL record format.
///
/// Multi-row writes travel as one event so replay sees them all or none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    GroupCreated {
        group: CourtGroup,
    },
    CourtCreated {
        court: Court,
    },
    SlotDefined {
        slot: TimeSlot,
    },
    PriceSet {
        row: PriceRow,
    },
    PriceRemoved {
        id: Ulid,
    },
    BookingsPlaced {
        court_id: Ulid,
        rule: Option<RecurringRule>,
        bookings: Vec<Booking>,
    },
    BookingStatusChanged {
        id: Ulid,
        court_id: Ulid,
        status: BookingStatus,
        payment_ref: Option<String>,
    },
    BookingExpired {
        id: Ulid,
        court_id: Ulid,
    },
    RuleCancelled {
        id: Ulid,
        updated_at: Ms,
    },
}

// ── Request & result types ───────────────────────────────────────

/// A weekly pattern as submitted by a client, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringRequest {
    pub court_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Canonical `0 = Sunday .. 6 = Saturday` numbers.
    pub weekdays: Vec<u8>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub booking_id: Ulid,
    pub court_name: String,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// A run of contiguous slot bookings of one reservation, merged for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookedBlock {
    pub reservation_id: Ulid,
    pub booking_ids: Vec<Ulid>,
    pub slot_ids: Vec<SlotId>,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub price: Money,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedSlot {
    pub slot_id: SlotId,
    pub range: TimeRange,
    pub unit_price: Money,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourtAvailability {
    pub court_id: Ulid,
    pub court_name: String,
    pub booked: Vec<BookedBlock>,
    pub priced_slots: Vec<PricedSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatePrice {
    pub date: NaiveDate,
    pub day_type: DayType,
    /// `None` when no price row resolves; the date would be skipped on create.
    pub price: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricePreview {
    pub total_count: usize,
    pub weekday_count: usize,
    pub weekend_count: usize,
    pub weekday_unit_price: Option<Money>,
    pub weekend_unit_price: Option<Money>,
    pub total_price: Money,
    pub dates: Vec<DatePrice>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingPreview {
    pub ranges: Vec<TimeRange>,
    pub total_price: Money,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringOutcome {
    pub rule: RecurringRule,
    pub expanded: usize,
    pub created: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RevenueSummary {
    pub group_id: Ulid,
    pub revenue: Money,
    pub previous_revenue: Money,
    pub bookings: usize,
    pub growth_percent: f64,
}
