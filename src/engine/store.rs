use std::collections::BTreeMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// Narrow persistence capability the scheduling algorithms depend on.
pub trait BookingRepository {
    /// Every booking (active or not) of `court_id` on `date`, sorted by start.
    fn find_by_court_and_date(&self, court_id: Ulid, date: NaiveDate) -> &[Booking];
    fn save(&mut self, booking: Booking);
    fn delete(&mut self, id: Ulid) -> Option<Booking>;
}

/// Booking state of one court. Guarded by the court's lock inside the engine.
#[derive(Debug, Clone)]
pub struct CourtState {
    pub id: Ulid,
    /// Per date, sorted by `range.start`.
    pub days: BTreeMap<NaiveDate, Vec<Booking>>,
}

impl CourtState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            days: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.days.values().flatten().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.days.values_mut().flatten().find(|b| b.id == id)
    }

    pub fn active_on(&self, date: NaiveDate) -> impl Iterator<Item = &Booking> {
        self.find_by_court_and_date(self.id, date)
            .iter()
            .filter(|b| b.status.is_active())
    }

    pub fn all_bookings(&self) -> impl Iterator<Item = &Booking> {
        self.days.values().flatten()
    }

    pub fn booking_count(&self, date: NaiveDate) -> usize {
        self.days.get(&date).map_or(0, Vec::len)
    }
}

impl BookingRepository for CourtState {
    fn find_by_court_and_date(&self, court_id: Ulid, date: NaiveDate) -> &[Booking] {
        if court_id != self.id {
            return &[];
        }
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Insert keeping the day sorted by start time. Replaces a row with the same id.
    fn save(&mut self, booking: Booking) {
        self.delete(booking.id);
        let day = self.days.entry(booking.date).or_default();
        let pos = day.partition_point(|b| b.range.start <= booking.range.start);
        day.insert(pos, booking);
    }

    fn delete(&mut self, id: Ulid) -> Option<Booking> {
        let mut emptied = None;
        let mut removed = None;
        for (date, day) in self.days.iter_mut() {
            if let Some(pos) = day.iter().position(|b| b.id == id) {
                removed = Some(day.remove(pos));
                if day.is_empty() {
                    emptied = Some(*date);
                }
                break;
            }
        }
        if let Some(date) = emptied {
            self.days.remove(&date);
        }
        removed
    }
}
