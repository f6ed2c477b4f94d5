use chrono::{Local, NaiveDate};

use crate::model::*;

use super::store::BookingRepository;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Every active booking of the court that overlaps `candidate` on any of `dates`.
///
/// Half-open semantics: a booking ending exactly at `candidate.start` (or
/// starting at `candidate.end`) is not a conflict.
pub fn find_conflicts(
    repo: &impl BookingRepository,
    court: &Court,
    dates: &[NaiveDate],
    candidate: &TimeRange,
) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for &date in dates {
        for existing in repo.find_by_court_and_date(court.id, date) {
            if !existing.status.is_active() {
                continue;
            }
            if candidate.start < existing.range.end && candidate.end > existing.range.start {
                conflicts.push(Conflict {
                    booking_id: existing.id,
                    court_name: court.name.clone(),
                    date,
                    start: existing.range.start,
                    end: existing.range.end,
                });
            }
        }
    }
    conflicts
}
