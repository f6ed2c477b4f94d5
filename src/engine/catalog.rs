use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::pricing::{day_type, resolve_price_row, PriceLookup};

/// Reference data: court groups, courts, catalog slots and price rows.
#[derive(Debug, Default)]
pub struct Catalog {
    pub groups: HashMap<Ulid, CourtGroup>,
    pub courts: HashMap<Ulid, Court>,
    /// Keyed by ordinal so iteration follows slot order.
    pub slots: BTreeMap<SlotId, TimeSlot>,
    pub prices: Vec<PriceRow>,
    next_price_seq: u64,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::GroupCreated { group } => {
                self.groups.insert(group.id, group.clone());
            }
            Event::CourtCreated { court } => {
                self.courts.insert(court.id, court.clone());
            }
            Event::SlotDefined { slot } => {
                self.slots.insert(slot.id, *slot);
            }
            Event::PriceSet { row } => {
                self.prices.retain(|r| r.id != row.id);
                self.next_price_seq = self.next_price_seq.max(row.seq + 1);
                self.prices.push(row.clone());
            }
            Event::PriceRemoved { id } => {
                self.prices.retain(|r| r.id != *id);
            }
            _ => {}
        }
    }

    pub fn next_price_seq(&self) -> u64 {
        self.next_price_seq
    }

    pub fn slot_list(&self) -> Vec<TimeSlot> {
        self.slots.values().copied().collect()
    }

    /// First slot (by ordinal) whose bounds contain or equal `range`.
    pub fn containing_slot(&self, range: &TimeRange) -> Option<&TimeSlot> {
        self.slots.values().find(|s| s.range.contains_range(range))
    }

    /// Courts of a group, ordered by name then id.
    pub fn courts_of(&self, group_id: Ulid) -> Vec<&Court> {
        let mut courts: Vec<&Court> = self
            .courts
            .values()
            .filter(|c| c.group_id == group_id)
            .collect();
        courts.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        courts
    }

    pub fn address_of(&self, court: &Court) -> String {
        self.groups
            .get(&court.group_id)
            .map(|g| g.address.snapshot())
            .unwrap_or_default()
    }

    /// Price view scoped to one court.
    pub fn pricing_for<'a>(&'a self, court: &'a Court) -> CourtPricing<'a> {
        CourtPricing {
            catalog: self,
            court,
        }
    }

    pub fn has_overlapping_slot(&self, slot: &TimeSlot) -> bool {
        self.slots
            .values()
            .any(|s| s.id != slot.id && s.range.overlaps(&slot.range))
    }

    /// True when adding `slot` would make ordinal order disagree with start
    /// time order.
    pub fn breaks_slot_order(&self, slot: &TimeSlot) -> bool {
        self.slots
            .values()
            .any(|s| s.id != slot.id && (s.id < slot.id) != (s.range.start < slot.range.start))
    }
}

/// The catalog's price rows as seen from a single court.
pub struct CourtPricing<'a> {
    catalog: &'a Catalog,
    court: &'a Court,
}

impl CourtPricing<'_> {
    pub fn row(&self, slot_id: SlotId, date: NaiveDate) -> Option<&PriceRow> {
        let group_rows = self
            .catalog
            .prices
            .iter()
            .filter(|r| r.group_id == self.court.group_id);
        resolve_price_row(group_rows, self.court.id, slot_id, day_type(date), date)
    }

    pub fn priced_slots(&self, date: NaiveDate) -> Vec<PricedSlot> {
        self.catalog
            .slots
            .values()
            .filter_map(|slot| {
                self.unit_price(slot.id, date).map(|unit_price| PricedSlot {
                    slot_id: slot.id,
                    range: slot.range,
                    unit_price,
                })
            })
            .collect()
    }
}

impl PriceLookup for CourtPricing<'_> {
    fn unit_price(&self, slot_id: SlotId, date: NaiveDate) -> Option<Money> {
        self.row(slot_id, date).map(|r| r.unit_price)
    }
}
