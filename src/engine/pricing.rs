use chrono::{Datelike, NaiveDate, Weekday};
use ulid::Ulid;

use crate::model::*;

/// Weekend iff Saturday or Sunday.
pub fn day_type(date: NaiveDate) -> DayType {
    match date.weekday() {
        Weekday::Sat | Weekday::Sun => DayType::Weekend,
        _ => DayType::Weekday,
    }
}

/// Source of unit prices for one court. Implemented by the catalog; tests
/// substitute their own tables.
pub trait PriceLookup {
    fn unit_price(&self, slot_id: SlotId, date: NaiveDate) -> Option<Money>;
}

/// Pick the effective row for `(slot, day_type)` on `date`.
///
/// Court-specific rows shadow group-wide rows when any exist. Among the
/// candidates the newest `effective_from <= date` wins; if none is effective
/// yet, the newest row overall is used instead of refusing to price.
pub fn resolve_price_row<'a>(
    rows: impl IntoIterator<Item = &'a PriceRow>,
    court_id: Ulid,
    slot_id: SlotId,
    kind: DayType,
    date: NaiveDate,
) -> Option<&'a PriceRow> {
    let matching: Vec<&PriceRow> = rows
        .into_iter()
        .filter(|r| r.slot_id == slot_id && r.day_type == kind)
        .filter(|r| r.court_id.is_none_or(|c| c == court_id))
        .collect();

    let has_specific = matching.iter().any(|r| r.court_id.is_some());
    let candidates = matching
        .into_iter()
        .filter(|r| r.court_id.is_some() == has_specific);

    let newest = |a: &&PriceRow, b: &&PriceRow| {
        a.effective_from
            .cmp(&b.effective_from)
            .then(a.seq.cmp(&b.seq))
    };

    let (effective, future): (Vec<&PriceRow>, Vec<&PriceRow>) =
        candidates.partition(|r| r.effective_from <= date);

    effective
        .into_iter()
        .max_by(newest)
        .or_else(|| future.into_iter().max_by(newest))
}

/// Number of whole granularity units in a range.
pub fn units(range: &TimeRange, unit_minutes: u32) -> i64 {
    range.minutes() / i64::from(unit_minutes.max(1))
}

/// Aligned-units charge: unit price times the number of units.
pub fn aligned_units_charge(unit_price: Money, range: &TimeRange, unit_minutes: u32) -> Money {
    unit_price * units(range, unit_minutes)
}

/// Overlap-sum charge used by the confirmation preview.
///
/// Each selected sub-range contributes the unit price of the first catalog
/// slot (by ordinal) overlapping it. Sub-ranges touching no priced slot add
/// nothing.
pub fn overlap_sum_charge(
    selected: &[TimeRange],
    slots: &[TimeSlot],
    prices: &impl PriceLookup,
    date: NaiveDate,
) -> Money {
    let mut ordered: Vec<&TimeSlot> = slots.iter().collect();
    ordered.sort_by_key(|s| s.id);

    selected
        .iter()
        .filter_map(|sub| {
            ordered
                .iter()
                .filter(|slot| slot.range.overlaps(sub))
                .find_map(|slot| prices.unit_price(slot.id, date))
        })
        .sum()
}
