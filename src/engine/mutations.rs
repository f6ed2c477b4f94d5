use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{now_ms, today};
use super::error::ValidationError;
use super::planner::{plan_recurring, plan_reservation, validate_recurring, ReservationRequest, WriteContext};
use super::store::CourtState;
use super::{Engine, EngineError, WalCommand};

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(ValidationError::Field(format!("{what} must not be empty")).into());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_user(user_id: &str) -> Result<(), EngineError> {
    if user_id.is_empty() {
        return Err(ValidationError::Field("user_id must not be empty".into()).into());
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    Ok(())
}

fn record_rejection(err: &EngineError) {
    if let EngineError::Conflict(list) = err {
        metrics::counter!(observability::CONFLICTS_REJECTED_TOTAL).increment(1);
        tracing::debug!(conflicts = list.len(), "write rejected by conflict gate");
    }
}

/// Ids inserted into an index ahead of the WAL append. Dropping an
/// uncommitted claim removes them again, so a failed or abandoned write
/// frees its ids.
pub(super) struct Claim<'a, V> {
    map: &'a DashMap<Ulid, V>,
    ids: Vec<Ulid>,
    committed: bool,
}

impl<'a, V> Claim<'a, V> {
    /// Insert every entry or none. Returns the first id already present.
    pub(super) fn take(
        map: &'a DashMap<Ulid, V>,
        entries: impl IntoIterator<Item = (Ulid, V)>,
    ) -> Result<Self, Ulid> {
        let mut claim = Claim {
            map,
            ids: Vec::new(),
            committed: false,
        };
        for (id, value) in entries {
            if let Entry::Vacant(slot) = map.entry(id) {
                slot.insert(value);
                claim.ids.push(id);
                continue;
            }
            return Err(id);
        }
        Ok(claim)
    }

    pub(super) fn commit(mut self) {
        self.committed = true;
    }
}

impl<V> Drop for Claim<'_, V> {
    fn drop(&mut self) {
        if !self.committed {
            for id in &self.ids {
                self.map.remove(id);
            }
        }
    }
}

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    pub async fn create_group(&self, group: CourtGroup) -> Result<(), EngineError> {
        check_name(&group.name, "group name")?;
        let mut catalog = self.catalog.write().await;
        if catalog.groups.contains_key(&group.id) {
            return Err(EngineError::AlreadyExists(format!("court group {}", group.id)));
        }
        let event = Event::GroupCreated { group };
        self.persist_catalog(&mut catalog, &event).await
    }

    pub async fn create_court(&self, court: Court) -> Result<(), EngineError> {
        check_name(&court.name, "court name")?;
        let mut catalog = self.catalog.write().await;
        if !catalog.groups.contains_key(&court.group_id) {
            return Err(EngineError::NotFound(court.group_id));
        }
        if catalog.courts.contains_key(&court.id) {
            return Err(EngineError::AlreadyExists(format!("court {}", court.id)));
        }
        let id = court.id;
        let event = Event::CourtCreated { court };
        self.persist_catalog(&mut catalog, &event).await?;
        self.courts.insert(id, Arc::new(RwLock::new(CourtState::new(id))));
        Ok(())
    }

    /// Add a catalog slot. Slots sit on the unit grid, never overlap, and
    /// ordinals increase with start time.
    pub async fn define_slot(&self, slot: TimeSlot) -> Result<(), EngineError> {
        if !slot.range.is_aligned(self.options.unit_minutes) {
            return Err(ValidationError::MisalignedRange {
                start: slot.range.start,
                end: slot.range.end,
            }
            .into());
        }
        let mut catalog = self.catalog.write().await;
        if catalog.slots.contains_key(&slot.id) {
            return Err(EngineError::AlreadyExists(format!("time slot {}", slot.id)));
        }
        if catalog.has_overlapping_slot(&slot) {
            return Err(ValidationError::Field(format!(
                "time slot {} overlaps an existing slot",
                slot.range
            ))
            .into());
        }
        if catalog.breaks_slot_order(&slot) {
            return Err(ValidationError::Field(format!(
                "time slot {} at {} is out of order with existing slots",
                slot.id, slot.range
            ))
            .into());
        }
        let event = Event::SlotDefined { slot };
        self.persist_catalog(&mut catalog, &event).await
    }

    /// Add a price row. `seq` is assigned here and orders rows created on the
    /// same effective date.
    pub async fn set_price(&self, mut row: PriceRow) -> Result<(), EngineError> {
        if row.unit_price < 0 {
            return Err(ValidationError::Field("unit_price must not be negative".into()).into());
        }
        let mut catalog = self.catalog.write().await;
        if !catalog.groups.contains_key(&row.group_id) {
            return Err(EngineError::NotFound(row.group_id));
        }
        if let Some(court_id) = row.court_id {
            match catalog.courts.get(&court_id) {
                Some(c) if c.group_id == row.group_id => {}
                Some(_) => {
                    return Err(ValidationError::Field(format!(
                        "court {court_id} is not in group {}",
                        row.group_id
                    ))
                    .into());
                }
                None => return Err(EngineError::NotFound(court_id)),
            }
        }
        if !catalog.slots.contains_key(&row.slot_id) {
            return Err(EngineError::UnknownSlot(row.slot_id));
        }
        if catalog.prices.iter().any(|r| r.id == row.id) {
            return Err(EngineError::AlreadyExists(format!("price {}", row.id)));
        }
        row.seq = catalog.next_price_seq();
        let event = Event::PriceSet { row };
        self.persist_catalog(&mut catalog, &event).await
    }

    pub async fn remove_price(&self, id: Ulid) -> Result<(), EngineError> {
        let mut catalog = self.catalog.write().await;
        if !catalog.prices.iter().any(|r| r.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::PriceRemoved { id };
        self.persist_catalog(&mut catalog, &event).await
    }

    // ── Booking writer ───────────────────────────────────────

    /// Validate, expand, gate on conflicts and persist a recurring rule with
    /// one CONFIRMED booking per priced date.
    pub async fn create_recurring(
        &self,
        rule_id: Ulid,
        user_id: String,
        req: RecurringRequest,
    ) -> Result<RecurringOutcome, EngineError> {
        check_user(&user_id)?;
        if self.rules.contains_key(&rule_id) {
            return Err(EngineError::AlreadyExists(format!("recurring rule {rule_id}")));
        }
        let catalog = self.catalog.read().await;
        let validated = validate_recurring(&req, &catalog, today(), self.options.unit_minutes)?;
        let court = &validated.court;
        let cs = self
            .get_court_state(&court.id)
            .ok_or(EngineError::NotFound(court.id))?;
        let mut guard = cs.write().await;

        let ctx = WriteContext {
            user_id,
            address: catalog.address_of(court),
            now: now_ms(),
            unit_minutes: self.options.unit_minutes,
        };
        let plan = plan_recurring(&*guard, &validated, &catalog.pricing_for(court), rule_id, &ctx)
            .inspect_err(record_rejection)?;
        // Held until the rule is in `rules`; never committed.
        let _claim = Claim::take(&self.rule_claims, [(rule_id, ())])
            .map_err(|id| EngineError::AlreadyExists(format!("recurring rule {id}")))?;
        if self.rules.contains_key(&rule_id) {
            return Err(EngineError::AlreadyExists(format!("recurring rule {rule_id}")));
        }

        let expanded = validated.dates.len();
        let created = plan.bookings.len();
        if !plan.skipped.is_empty() {
            metrics::counter!(observability::PRICE_SKIPS_TOTAL).increment(plan.skipped.len() as u64);
        }

        let rule = plan.rule.clone();
        let event = Event::BookingsPlaced {
            court_id: court.id,
            rule: Some(plan.rule),
            bookings: plan.bookings,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "kind" => "recurring")
            .increment(created as u64);
        tracing::info!(
            rule_id = %rule_id,
            court_id = %court.id,
            expanded,
            created,
            "recurring booking created"
        );

        Ok(RecurringOutcome {
            rule,
            expanded,
            created,
        })
    }

    /// Persist an ad-hoc reservation. Every row starts PAYING and waits for
    /// payment or the sweeper.
    pub async fn place_reservation(&self, req: ReservationRequest) -> Result<Vec<Booking>, EngineError> {
        check_user(&req.user_id)?;
        if let Some((dup, _, _)) = req.items.iter().find(|(id, _, _)| self.booking_to_court.contains_key(id)) {
            return Err(EngineError::AlreadyExists(format!("booking {dup}")));
        }
        let catalog = self.catalog.read().await;
        let cs = match self.get_court_state(&req.court_id) {
            Some(cs) => cs,
            // let the planner report validation errors before not-found
            None => Arc::new(RwLock::new(CourtState::new(req.court_id))),
        };
        let mut guard = cs.write().await;

        let address = catalog
            .courts
            .get(&req.court_id)
            .map(|c| catalog.address_of(c))
            .unwrap_or_default();
        let ctx = WriteContext {
            user_id: req.user_id.clone(),
            address,
            now: now_ms(),
            unit_minutes: self.options.unit_minutes,
        };
        let rows = plan_reservation(&*guard, &req, &catalog, today(), &ctx)
            .inspect_err(record_rejection)?;

        let claim = Claim::take(&self.booking_to_court, rows.iter().map(|b| (b.id, b.court_id)))
            .map_err(|id| EngineError::AlreadyExists(format!("booking {id}")))?;
        let event = Event::BookingsPlaced {
            court_id: req.court_id,
            rule: None,
            bookings: rows.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        claim.commit();
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL, "kind" => "single")
            .increment(rows.len() as u64);
        Ok(rows)
    }

    /// Single-range convenience over [`Engine::place_reservation`].
    pub async fn create_booking(
        &self,
        id: Ulid,
        user_id: String,
        court_id: Ulid,
        date: chrono::NaiveDate,
        range: TimeRange,
    ) -> Result<Booking, EngineError> {
        let mut rows = self
            .place_reservation(ReservationRequest {
                user_id,
                court_id,
                date,
                items: vec![(id, range.start, range.end)],
            })
            .await?;
        rows.pop()
            .ok_or_else(|| EngineError::WalError("reservation produced no rows".into()))
    }

    // ── Status transitions ───────────────────────────────────

    async fn transition(
        &self,
        id: Ulid,
        to: BookingStatus,
        payment_ref: Option<String>,
    ) -> Result<Booking, EngineError> {
        let (court_id, mut guard) = self.resolve_booking_write(&id).await?;
        let from = guard.get(id).ok_or(EngineError::NotFound(id))?.status;
        if !from.can_become(to) {
            return Err(EngineError::InvalidTransition { id, from, to });
        }
        let event = Event::BookingStatusChanged {
            id,
            court_id,
            status: to,
            payment_ref,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// PAYING → CONFIRMED, recording the proof of payment.
    pub async fn confirm_payment(&self, id: Ulid, proof_ref: String) -> Result<Booking, EngineError> {
        if proof_ref.is_empty() {
            return Err(ValidationError::Field("proof_ref must not be empty".into()).into());
        }
        if proof_ref.len() > MAX_PAYMENT_REF_LEN {
            return Err(EngineError::LimitExceeded("payment reference too long"));
        }
        self.transition(id, BookingStatus::Confirmed, Some(proof_ref)).await
    }

    /// CONFIRMED → COMPLETED.
    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::Completed, None).await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::Cancelled, None).await
    }

    /// Mark a rule CANCELLED. Bookings it generated keep their status.
    pub async fn cancel_rule(&self, id: Ulid) -> Result<RecurringRule, EngineError> {
        let _catalog = self.catalog.read().await;
        let status = self
            .rules
            .get(&id)
            .map(|r| r.status)
            .ok_or(EngineError::NotFound(id))?;
        if status == RuleStatus::Cancelled {
            return Err(ValidationError::Field(format!("recurring rule {id} is already cancelled")).into());
        }
        let updated_at = now_ms();
        let event = Event::RuleCancelled { id, updated_at };
        self.wal_append(&event).await?;
        let mut rule = self.rules.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        rule.status = RuleStatus::Cancelled;
        rule.updated_at = updated_at;
        Ok(rule.clone())
    }

    // ── Expiry ───────────────────────────────────────────────

    /// PAYING bookings created at or before `now - grace_ms`, as
    /// `(booking id, court id)`. Courts locked by a writer are skipped until
    /// the next sweep.
    pub fn collect_expired_payments(&self, now: Ms, grace_ms: Ms) -> Vec<(Ulid, Ulid)> {
        let cutoff = now - grace_ms;
        let mut expired = Vec::new();
        for entry in self.courts.iter() {
            let cs = entry.value().clone();
            if let Ok(guard) = cs.try_read() {
                expired.extend(
                    guard
                        .all_bookings()
                        .filter(|b| b.status == BookingStatus::Paying && b.created_at <= cutoff)
                        .map(|b| (b.id, guard.id)),
                );
            }
        }
        expired
    }

    /// Remove a PAYING booking whose grace window has passed. Returns
    /// `Ok(false)` when the booking was paid or cancelled in the meantime.
    pub async fn expire_booking(&self, id: Ulid, now: Ms, grace_ms: Ms) -> Result<bool, EngineError> {
        let (court_id, mut guard) = self.resolve_booking_write(&id).await?;
        let Some(booking) = guard.get(id) else {
            return Err(EngineError::NotFound(id));
        };
        if booking.status != BookingStatus::Paying || booking.created_at > now - grace_ms {
            return Ok(false);
        }
        let event = Event::BookingExpired { id, court_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with the minimal event set that recreates current state.
    ///
    /// Holds the catalog write lock and every court's read lock until the
    /// compacted file is swapped in, so no write lands between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let catalog = self.catalog.write().await;
        let mut events = Vec::new();

        let mut groups: Vec<&CourtGroup> = catalog.groups.values().collect();
        groups.sort_by_key(|g| g.id);
        events.extend(groups.into_iter().map(|g| Event::GroupCreated { group: g.clone() }));

        let mut courts: Vec<&Court> = catalog.courts.values().collect();
        courts.sort_by_key(|c| c.id);
        events.extend(courts.iter().map(|&c| Event::CourtCreated { court: c.clone() }));

        events.extend(catalog.slots.values().map(|&slot| Event::SlotDefined { slot }));

        let mut prices = catalog.prices.clone();
        prices.sort_by_key(|r| r.seq);
        events.extend(prices.into_iter().map(|row| Event::PriceSet { row }));

        let mut rules: Vec<RecurringRule> = self.rules.iter().map(|r| r.value().clone()).collect();
        rules.sort_by_key(|r| r.id);
        events.extend(rules.into_iter().map(|rule| Event::BookingsPlaced {
            court_id: rule.court_id,
            rule: Some(rule),
            bookings: Vec::new(),
        }));

        let mut held = Vec::with_capacity(courts.len());
        for court in courts {
            let Some(cs) = self.get_court_state(&court.id) else {
                continue;
            };
            let guard = cs.read_owned().await;
            let bookings: Vec<Booking> = guard.all_bookings().cloned().collect();
            if !bookings.is_empty() {
                events.push(Event::BookingsPlaced {
                    court_id: court.id,
                    rule: None,
                    bookings,
                });
            }
            held.push(guard);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(held);
        drop(catalog);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
