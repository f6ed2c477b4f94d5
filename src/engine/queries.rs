use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::report::growth_percent;

use super::availability::{merge_booked_blocks, merge_ranges};
use super::conflict::{find_conflicts, today};
use super::error::ValidationError;
use super::planner::{price_dates, validate_recurring};
use super::pricing::{overlap_sum_charge, PriceLookup};
use super::store::BookingRepository;
use super::{Engine, EngineError};

impl Engine {
    /// Per court of the group: merged booked blocks and the priced catalog slots.
    pub async fn availability(
        &self,
        group_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<CourtAvailability>, EngineError> {
        let catalog = self.catalog.read().await;
        if !catalog.groups.contains_key(&group_id) {
            return Err(EngineError::NotFound(group_id));
        }
        let mut out = Vec::new();
        for court in catalog.courts_of(group_id) {
            let booked = match self.get_court_state(&court.id) {
                Some(cs) => {
                    let guard = cs.read().await;
                    merge_booked_blocks(guard.find_by_court_and_date(court.id, date))
                }
                None => Vec::new(),
            };
            out.push(CourtAvailability {
                court_id: court.id,
                court_name: court.name.clone(),
                booked,
                priced_slots: catalog.pricing_for(court).priced_slots(date),
            });
        }
        Ok(out)
    }

    /// Every active booking a recurring request would collide with. Writes nothing.
    pub async fn check_conflicts(&self, req: &RecurringRequest) -> Result<Vec<Conflict>, EngineError> {
        let catalog = self.catalog.read().await;
        let v = validate_recurring(req, &catalog, today(), self.options.unit_minutes)?;
        let cs = self
            .get_court_state(&v.court.id)
            .ok_or(EngineError::NotFound(v.court.id))?;
        let guard = cs.read().await;
        Ok(find_conflicts(&*guard, &v.court, &v.dates, &v.range))
    }

    /// Counts, unit prices and per-date charges for a recurring request.
    pub async fn price_preview(&self, req: &RecurringRequest) -> Result<PricePreview, EngineError> {
        let catalog = self.catalog.read().await;
        let v = validate_recurring(req, &catalog, today(), self.options.unit_minutes)?;
        let pricing = catalog.pricing_for(&v.court);
        let dates = price_dates(&v, &pricing, self.options.unit_minutes);

        let first_unit = |kind: DayType| {
            dates
                .iter()
                .find(|d| d.day_type == kind)
                .and_then(|d| pricing.unit_price(v.slot.id, d.date))
        };
        let weekday_count = dates.iter().filter(|d| d.day_type == DayType::Weekday).count();

        Ok(PricePreview {
            total_count: dates.len(),
            weekday_count,
            weekend_count: dates.len() - weekday_count,
            weekday_unit_price: first_unit(DayType::Weekday),
            weekend_unit_price: first_unit(DayType::Weekend),
            total_price: dates.iter().filter_map(|d| d.price).sum(),
            dates,
        })
    }

    /// Merged ranges and overlap-sum total for an ad-hoc selection.
    pub async fn booking_preview(
        &self,
        group_id: Ulid,
        court_id: Ulid,
        date: NaiveDate,
        ranges: &[TimeRange],
    ) -> Result<BookingPreview, EngineError> {
        if ranges.is_empty() {
            return Err(ValidationError::EmptySelection.into());
        }
        if ranges.len() > MAX_RESERVATION_RANGES {
            return Err(EngineError::LimitExceeded("too many ranges in one reservation"));
        }
        let catalog = self.catalog.read().await;
        let court = catalog
            .courts
            .get(&court_id)
            .filter(|c| c.group_id == group_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let total_price =
            overlap_sum_charge(ranges, &catalog.slot_list(), &catalog.pricing_for(court), date);
        Ok(BookingPreview {
            ranges: merge_ranges(ranges),
            total_price,
        })
    }

    /// Every booking of a court on a date, any status, ordered by start.
    pub async fn list_bookings(&self, court_id: Ulid, date: NaiveDate) -> Result<Vec<Booking>, EngineError> {
        let cs = self
            .get_court_state(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = cs.read().await;
        Ok(guard.find_by_court_and_date(court_id, date).to_vec())
    }

    pub fn list_rules(&self, id: Option<Ulid>) -> Result<Vec<RecurringRule>, EngineError> {
        match id {
            Some(id) => self
                .rules
                .get(&id)
                .map(|r| vec![r.value().clone()])
                .ok_or(EngineError::NotFound(id)),
            None => {
                let mut rules: Vec<RecurringRule> =
                    self.rules.iter().map(|r| r.value().clone()).collect();
                rules.sort_by_key(|r| r.id);
                Ok(rules)
            }
        }
    }

    /// Revenue of CONFIRMED and COMPLETED bookings in `[start, end]`, compared
    /// with the equally long period right before it.
    pub async fn revenue(
        &self,
        group_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RevenueSummary, EngineError> {
        if end < start {
            return Err(ValidationError::DateOrder { start, end }.into());
        }
        let span_days = (end - start).num_days() + 1;
        if span_days > MAX_REPORT_SPAN_DAYS {
            return Err(EngineError::LimitExceeded("report window too wide"));
        }
        let prev_start = start - Days::new(span_days as u64);

        let catalog = self.catalog.read().await;
        if !catalog.groups.contains_key(&group_id) {
            return Err(EngineError::NotFound(group_id));
        }

        let mut revenue = 0;
        let mut previous_revenue = 0;
        let mut bookings = 0;
        for court in catalog.courts_of(group_id) {
            let Some(cs) = self.get_court_state(&court.id) else {
                continue;
            };
            let guard = cs.read().await;
            for (date, day) in guard.days.range(prev_start..=end) {
                for b in day.iter().filter(|b| earns_revenue(b.status)) {
                    if *date >= start {
                        revenue += b.price;
                        bookings += 1;
                    } else {
                        previous_revenue += b.price;
                    }
                }
            }
        }

        Ok(RevenueSummary {
            group_id,
            revenue,
            previous_revenue,
            bookings,
            growth_percent: growth_percent(previous_revenue, revenue),
        })
    }
}

fn earns_revenue(status: BookingStatus) -> bool {
    matches!(status, BookingStatus::Confirmed | BookingStatus::Completed)
}
