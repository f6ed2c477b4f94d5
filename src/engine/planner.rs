//! Validation and planning for booking writes.
//!
//! Everything here is pure: it reads a [`BookingRepository`], the catalog and a
//! [`PriceLookup`], and returns the rows to persist. The engine runs it while
//! holding the court's write lock, then commits the plan as one WAL record.

use chrono::{NaiveDate, NaiveTime};
use tracing::warn;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::merge_ranges;
use super::catalog::Catalog;
use super::conflict::find_conflicts;
use super::error::{EngineError, ValidationError};
use super::pricing::{aligned_units_charge, day_type, PriceLookup};
use super::recurrence::expand_dates;
use super::store::BookingRepository;

/// A recurring request that passed every pre-write check.
#[derive(Debug, Clone)]
pub struct ValidatedRecurring {
    pub court: Court,
    pub slot: TimeSlot,
    pub range: TimeRange,
    pub weekdays: WeekdaySet,
    pub dates: Vec<NaiveDate>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Who is writing, and when.
#[derive(Debug, Clone)]
pub struct WriteContext {
    pub user_id: String,
    pub address: String,
    pub now: Ms,
    pub unit_minutes: u32,
}

#[derive(Debug, Clone)]
pub struct RecurringPlan {
    pub rule: RecurringRule,
    pub bookings: Vec<Booking>,
    pub skipped: Vec<NaiveDate>,
}

/// An ad-hoc reservation: one or more ranges on one court and date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub user_id: String,
    pub court_id: Ulid,
    pub date: NaiveDate,
    /// `(booking id, start, end)` per range. The first id names the reservation.
    pub items: Vec<(Ulid, NaiveTime, NaiveTime)>,
}

fn checked_range(start: NaiveTime, end: NaiveTime) -> Result<TimeRange, ValidationError> {
    TimeRange::checked(start, end).ok_or(ValidationError::TimeOrder { start, end })
}

/// The catalog slot a booking range lives in. The range must sit on the unit
/// grid and inside a single slot.
pub fn resolve_slot(
    catalog: &Catalog,
    range: &TimeRange,
    unit_minutes: u32,
) -> Result<TimeSlot, ValidationError> {
    let misaligned = ValidationError::MisalignedRange {
        start: range.start,
        end: range.end,
    };
    if !range.is_aligned(unit_minutes) {
        return Err(misaligned);
    }
    catalog.containing_slot(range).copied().ok_or(misaligned)
}

/// Run the fail-fast validation chain for a recurring request.
pub fn validate_recurring(
    req: &RecurringRequest,
    catalog: &Catalog,
    today: NaiveDate,
    unit_minutes: u32,
) -> Result<ValidatedRecurring, EngineError> {
    if req.end_date < req.start_date {
        return Err(ValidationError::DateOrder {
            start: req.start_date,
            end: req.end_date,
        }
        .into());
    }
    let range = checked_range(req.start_time, req.end_time)?;
    if req.weekdays.is_empty() {
        return Err(ValidationError::EmptyWeekdays.into());
    }
    let weekdays = WeekdaySet::from_canonical(&req.weekdays).map_err(ValidationError::InvalidWeekday)?;
    if req.start_date < today {
        return Err(ValidationError::StartInPast {
            start: req.start_date,
            today,
        }
        .into());
    }
    if (req.end_date - req.start_date).num_days() > MAX_RECURRING_SPAN_DAYS {
        return Err(EngineError::LimitExceeded("recurring window too long"));
    }
    let court = catalog
        .courts
        .get(&req.court_id)
        .cloned()
        .ok_or(EngineError::NotFound(req.court_id))?;
    let slot = resolve_slot(catalog, &range, unit_minutes)?;

    let dates = expand_dates(req.start_date, req.end_date, weekdays)?;
    if dates.is_empty() {
        return Err(ValidationError::NoMatchingDates {
            start: req.start_date,
            end: req.end_date,
        }
        .into());
    }

    Ok(ValidatedRecurring {
        court,
        slot,
        range,
        weekdays,
        dates,
        start_date: req.start_date,
        end_date: req.end_date,
    })
}

/// Price every expanded date with the aligned-units method.
pub fn price_dates(
    v: &ValidatedRecurring,
    prices: &impl PriceLookup,
    unit_minutes: u32,
) -> Vec<DatePrice> {
    v.dates
        .iter()
        .map(|&date| DatePrice {
            date,
            day_type: day_type(date),
            price: prices
                .unit_price(v.slot.id, date)
                .map(|unit| aligned_units_charge(unit, &v.range, unit_minutes)),
        })
        .collect()
}

/// Build the rule and its concrete bookings.
///
/// Any conflict on any expanded date aborts the whole plan. Dates with no
/// resolvable price are skipped and logged, never charged zero.
pub fn plan_recurring(
    repo: &impl BookingRepository,
    v: &ValidatedRecurring,
    prices: &impl PriceLookup,
    rule_id: Ulid,
    ctx: &WriteContext,
) -> Result<RecurringPlan, EngineError> {
    let conflicts = find_conflicts(repo, &v.court, &v.dates, &v.range);
    if !conflicts.is_empty() {
        return Err(EngineError::Conflict(conflicts));
    }

    let rule = RecurringRule {
        id: rule_id,
        user_id: ctx.user_id.clone(),
        court_id: v.court.id,
        start_date: v.start_date,
        end_date: v.end_date,
        weekdays: v.weekdays,
        range: v.range,
        status: RuleStatus::Active,
        created_at: ctx.now,
        updated_at: ctx.now,
    };

    let mut bookings = Vec::with_capacity(v.dates.len());
    let mut skipped = Vec::new();
    for dp in price_dates(v, prices, ctx.unit_minutes) {
        let Some(price) = dp.price else {
            warn!(
                rule_id = %rule_id,
                court_id = %v.court.id,
                date = %dp.date,
                "no price resolvable, skipping date"
            );
            skipped.push(dp.date);
            continue;
        };
        if repo.find_by_court_and_date(v.court.id, dp.date).len() >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings on one day"));
        }
        let id = Ulid::new();
        bookings.push(Booking {
            id,
            reservation_id: id,
            rule_id: Some(rule_id),
            user_id: ctx.user_id.clone(),
            court_id: v.court.id,
            slot_id: v.slot.id,
            date: dp.date,
            range: v.range,
            status: BookingStatus::Confirmed,
            price,
            address: ctx.address.clone(),
            payment_ref: None,
            created_at: ctx.now,
        });
    }

    Ok(RecurringPlan {
        rule,
        bookings,
        skipped,
    })
}

/// Validate and plan an ad-hoc reservation. Every row is created PAYING and
/// the reservation commits or fails as a unit.
pub fn plan_reservation(
    repo: &impl BookingRepository,
    req: &ReservationRequest,
    catalog: &Catalog,
    today: NaiveDate,
    ctx: &WriteContext,
) -> Result<Vec<Booking>, EngineError> {
    let Some(&(reservation_id, _, _)) = req.items.first() else {
        return Err(ValidationError::EmptySelection.into());
    };
    if req.items.len() > MAX_RESERVATION_RANGES {
        return Err(EngineError::LimitExceeded("too many ranges in one reservation"));
    }
    for (i, (id, _, _)) in req.items.iter().enumerate() {
        if req.items[..i].iter().any(|(seen, _, _)| seen == id) {
            return Err(ValidationError::DuplicateBookingId(*id).into());
        }
    }
    let ranges: Vec<TimeRange> = req
        .items
        .iter()
        .map(|&(_, start, end)| checked_range(start, end))
        .collect::<Result<_, _>>()?;
    if req.date < today {
        return Err(ValidationError::StartInPast {
            start: req.date,
            today,
        }
        .into());
    }
    let court = catalog
        .courts
        .get(&req.court_id)
        .ok_or(EngineError::NotFound(req.court_id))?;
    let slots: Vec<TimeSlot> = ranges
        .iter()
        .map(|r| resolve_slot(catalog, r, ctx.unit_minutes))
        .collect::<Result<_, _>>()?;

    let total_minutes: i64 = ranges.iter().map(TimeRange::minutes).sum();
    let merged_minutes: i64 = merge_ranges(&ranges).iter().map(TimeRange::minutes).sum();
    if merged_minutes != total_minutes {
        return Err(ValidationError::OverlappingSelection.into());
    }

    let conflicts: Vec<Conflict> = ranges
        .iter()
        .flat_map(|r| find_conflicts(repo, court, &[req.date], r))
        .collect();
    if !conflicts.is_empty() {
        return Err(EngineError::Conflict(conflicts));
    }
    if repo.find_by_court_and_date(court.id, req.date).len() + ranges.len() > MAX_BOOKINGS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many bookings on one day"));
    }

    let prices = catalog.pricing_for(court);
    req.items
        .iter()
        .zip(ranges.iter().zip(slots.iter()))
        .map(|(&(id, _, _), (range, slot))| -> Result<Booking, EngineError> {
            let unit = prices.unit_price(slot.id, req.date).ok_or_else(|| {
                ValidationError::Field(format!(
                    "no price configured for {} on {}",
                    range, req.date
                ))
            })?;
            Ok(Booking {
                id,
                reservation_id,
                rule_id: None,
                user_id: ctx.user_id.clone(),
                court_id: court.id,
                slot_id: slot.id,
                date: req.date,
                range: *range,
                status: BookingStatus::Paying,
                price: aligned_units_charge(unit, range, ctx.unit_minutes),
                address: ctx.address.clone(),
                payment_ref: None,
                created_at: ctx.now,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::CourtState;
    use std::collections::HashSet;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    /// Weekday price everywhere except on the listed dates.
    struct Holes {
        unit: Money,
        missing: HashSet<NaiveDate>,
    }

    impl PriceLookup for Holes {
        fn unit_price(&self, _slot_id: SlotId, date: NaiveDate) -> Option<Money> {
            (!self.missing.contains(&date)).then_some(self.unit)
        }
    }

    fn catalog() -> (Catalog, Court) {
        let mut cat = Catalog::new();
        let group = CourtGroup {
            id: Ulid::new(),
            name: "Lakeside".into(),
            address: Address {
                street: "5 Lake Rd".into(),
                district: "Tay Ho".into(),
                province: "Ha Noi".into(),
            },
        };
        let court = Court { id: Ulid::new(), group_id: group.id, name: "Court 2".into() };
        cat.apply(&Event::GroupCreated { group });
        cat.apply(&Event::CourtCreated { court: court.clone() });
        cat.apply(&Event::SlotDefined {
            slot: TimeSlot { id: 1, range: TimeRange::new(t(6, 0), t(17, 0)) },
        });
        cat.apply(&Event::SlotDefined {
            slot: TimeSlot { id: 2, range: TimeRange::new(t(17, 0), t(22, 0)) },
        });
        (cat, court)
    }

    fn ctx() -> WriteContext {
        WriteContext {
            user_id: "owner-1".into(),
            address: "5 Lake Rd, Tay Ho, Ha Noi".into(),
            now: 1_000,
            unit_minutes: 30,
        }
    }

    fn request(court: Ulid, weekdays: Vec<u8>) -> RecurringRequest {
        RecurringRequest {
            court_id: court,
            start_date: d(2024, 1, 1),
            end_date: d(2024, 1, 14),
            weekdays,
            start_time: t(18, 0),
            end_time: t(19, 0),
        }
    }

    #[test]
    fn validation_order_date_before_time() {
        let (cat, court) = catalog();
        let mut req = request(court.id, vec![]);
        req.end_date = d(2023, 12, 1);
        req.end_time = t(17, 0);
        let err = validate_recurring(&req, &cat, d(2024, 1, 1), 30).unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::DateOrder { .. })));
    }

    #[test]
    fn validation_rejects_bad_inputs() {
        let (cat, court) = catalog();
        let today = d(2024, 1, 1);

        let mut req = request(court.id, vec![1]);
        req.end_time = t(18, 0);
        assert!(matches!(
            validate_recurring(&req, &cat, today, 30),
            Err(EngineError::Validation(ValidationError::TimeOrder { .. }))
        ));

        let req = request(court.id, vec![]);
        assert!(matches!(
            validate_recurring(&req, &cat, today, 30),
            Err(EngineError::Validation(ValidationError::EmptyWeekdays))
        ));

        let req = request(court.id, vec![9]);
        assert!(matches!(
            validate_recurring(&req, &cat, today, 30),
            Err(EngineError::Validation(ValidationError::InvalidWeekday(9)))
        ));

        let req = request(court.id, vec![1]);
        assert!(matches!(
            validate_recurring(&req, &cat, d(2024, 1, 2), 30),
            Err(EngineError::Validation(ValidationError::StartInPast { .. }))
        ));

        let req = request(Ulid::new(), vec![1]);
        assert!(matches!(validate_recurring(&req, &cat, today, 30), Err(EngineError::NotFound(_))));

        let mut req = request(court.id, vec![1]);
        req.start_time = t(16, 0);
        assert!(matches!(
            validate_recurring(&req, &cat, today, 30),
            Err(EngineError::Validation(ValidationError::MisalignedRange { .. }))
        ));

        let mut req = request(court.id, vec![1]);
        req.start_time = t(18, 10);
        assert!(matches!(
            validate_recurring(&req, &cat, today, 30),
            Err(EngineError::Validation(ValidationError::MisalignedRange { .. }))
        ));
    }

    #[test]
    fn no_matching_dates_rejected() {
        let (cat, court) = catalog();
        let mut req = request(court.id, vec![6]);
        req.end_date = d(2024, 1, 5); // Mon..Fri, no Saturday
        assert!(matches!(
            validate_recurring(&req, &cat, d(2024, 1, 1), 30),
            Err(EngineError::Validation(ValidationError::NoMatchingDates { .. }))
        ));
    }

    #[test]
    fn unpriced_wednesday_skipped() {
        let (cat, court) = catalog();
        let req = request(court.id, vec![1, 3]);
        let v = validate_recurring(&req, &cat, d(2024, 1, 1), 30).unwrap();
        assert_eq!(v.dates.len(), 4);

        let prices = Holes {
            unit: 50_000,
            missing: HashSet::from([d(2024, 1, 10)]),
        };
        let repo = CourtState::new(court.id);
        let plan = plan_recurring(&repo, &v, &prices, Ulid::new(), &ctx()).unwrap();
        assert_eq!(plan.bookings.len(), 3);
        assert_eq!(plan.skipped, vec![d(2024, 1, 10)]);
        assert_eq!(plan.rule.status, RuleStatus::Active);
        assert!(plan.bookings.iter().all(|b| b.price == 100_000));
        assert!(plan.bookings.iter().all(|b| b.status == BookingStatus::Confirmed));
        assert!(plan.bookings.iter().all(|b| b.rule_id == Some(plan.rule.id)));
    }

    #[test]
    fn any_conflict_aborts_whole_plan() {
        let (cat, court) = catalog();
        let req = request(court.id, vec![1, 3]);
        let v = validate_recurring(&req, &cat, d(2024, 1, 1), 30).unwrap();

        let mut repo = CourtState::new(court.id);
        let existing = Ulid::new();
        repo.save(Booking {
            id: existing,
            reservation_id: existing,
            rule_id: None,
            user_id: "someone".into(),
            court_id: court.id,
            slot_id: 2,
            date: d(2024, 1, 8),
            range: TimeRange::new(t(18, 30), t(20, 0)),
            status: BookingStatus::Paying,
            price: 1,
            address: String::new(),
            payment_ref: None,
            created_at: 0,
        });
        let prices = Holes { unit: 1, missing: HashSet::new() };
        match plan_recurring(&repo, &v, &prices, Ulid::new(), &ctx()) {
            Err(EngineError::Conflict(list)) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].booking_id, existing);
                assert_eq!(list[0].date, d(2024, 1, 8));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn reservation_rows_share_identity() {
        let (mut cat, court) = catalog();
        cat.apply(&Event::PriceSet {
            row: PriceRow {
                id: Ulid::new(),
                group_id: court.group_id,
                court_id: None,
                slot_id: 2,
                day_type: DayType::Weekday,
                unit_price: 50_000,
                effective_from: d(2023, 1, 1),
                seq: 0,
            },
        });
        let first = Ulid::new();
        let req = ReservationRequest {
            user_id: "u9".into(),
            court_id: court.id,
            date: d(2024, 1, 3),
            items: vec![(first, t(18, 0), t(19, 0)), (Ulid::new(), t(19, 0), t(19, 30))],
        };
        let repo = CourtState::new(court.id);
        let rows = plan_reservation(&repo, &req, &cat, d(2024, 1, 1), &ctx()).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|b| b.reservation_id == first));
        assert!(rows.iter().all(|b| b.status == BookingStatus::Paying));
        assert_eq!(rows[0].price, 100_000);
        assert_eq!(rows[1].price, 50_000);
    }

    #[test]
    fn reservation_rejects_self_overlap_and_unpriced() {
        let (cat, court) = catalog();
        let repo = CourtState::new(court.id);
        let overlapping = ReservationRequest {
            user_id: "u".into(),
            court_id: court.id,
            date: d(2024, 1, 3),
            items: vec![(Ulid::new(), t(18, 0), t(19, 0)), (Ulid::new(), t(18, 30), t(19, 30))],
        };
        assert!(matches!(
            plan_reservation(&repo, &overlapping, &cat, d(2024, 1, 1), &ctx()),
            Err(EngineError::Validation(ValidationError::OverlappingSelection))
        ));

        let unpriced = ReservationRequest {
            items: vec![(Ulid::new(), t(18, 0), t(19, 0))],
            ..overlapping
        };
        assert!(matches!(
            plan_reservation(&repo, &unpriced, &cat, d(2024, 1, 1), &ctx()),
            Err(EngineError::Validation(ValidationError::Field(_)))
        ));

        let id = Ulid::new();
        let reused = ReservationRequest {
            user_id: "u".into(),
            court_id: court.id,
            date: d(2024, 1, 3),
            items: vec![(id, t(18, 0), t(19, 0)), (id, t(19, 0), t(20, 0))],
        };
        assert!(matches!(
            plan_reservation(&repo, &reused, &cat, d(2024, 1, 1), &ctx()),
            Err(EngineError::Validation(ValidationError::DuplicateBookingId(dup))) if dup == id
        ));

        let empty = ReservationRequest { items: vec![], ..unpriced };
        assert!(matches!(
            plan_reservation(&repo, &empty, &cat, d(2024, 1, 1), &ctx()),
            Err(EngineError::Validation(ValidationError::EmptySelection))
        ));
    }
}
