use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::{BookingStatus, Conflict, SlotId};

/// Rejections raised before anything is written. Always fixable by the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("end date {end} is before start date {start}")]
    DateOrder { start: NaiveDate, end: NaiveDate },
    #[error("end time {end} must be after start time {start}")]
    TimeOrder { start: NaiveTime, end: NaiveTime },
    #[error("weekday set is empty")]
    EmptyWeekdays,
    #[error("weekday {0} out of range (0 = Sunday .. 6 = Saturday)")]
    InvalidWeekday(u8),
    #[error("start date {start} is before today ({today})")]
    StartInPast { start: NaiveDate, today: NaiveDate },
    #[error("time range {start}-{end} does not fit a catalog slot")]
    MisalignedRange { start: NaiveTime, end: NaiveTime },
    #[error("no date between {start} and {end} matches the weekday set")]
    NoMatchingDates { start: NaiveDate, end: NaiveDate },
    #[error("reservation has no time ranges")]
    EmptySelection,
    #[error("reservation ranges overlap each other")]
    OverlappingSelection,
    #[error("booking id {0} appears more than once in the reservation")]
    DuplicateBookingId(Ulid),
    #[error("{0}")]
    Field(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("{} conflicting booking(s)", .0.len())]
    Conflict(Vec<Conflict>),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("unknown time slot: {0}")]
    UnknownSlot(SlotId),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("booking {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}
