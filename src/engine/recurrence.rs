use chrono::{Datelike, NaiveDate, Weekday};

use crate::model::WeekdaySet;

use super::error::ValidationError;

// Two weekday numberings are in play:
//   canonical: 0 = Sunday .. 6 = Saturday  (client-facing, WeekdaySet)
//   ISO:       1 = Monday .. 7 = Sunday    (chrono's number_from_monday)
// Every crossing goes through one of the functions below.

/// Canonical number of a chrono weekday.
pub fn canonical_weekday(day: Weekday) -> u8 {
    day.num_days_from_sunday() as u8
}

/// ISO `1..=7` to canonical `0..=6`. Only Sunday moves (7 → 0).
pub fn iso_to_canonical(iso: u8) -> Option<u8> {
    match iso {
        1..=6 => Some(iso),
        7 => Some(0),
        _ => None,
    }
}

/// Every date in `[start, end]` whose weekday is in `days`, ascending.
pub fn expand_dates(
    start: NaiveDate,
    end: NaiveDate,
    days: WeekdaySet,
) -> Result<Vec<NaiveDate>, ValidationError> {
    if end < start {
        return Err(ValidationError::DateOrder { start, end });
    }
    if days.is_empty() {
        return Ok(Vec::new());
    }
    Ok(start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| days.contains(canonical_weekday(d.weekday())))
        .collect())
}
