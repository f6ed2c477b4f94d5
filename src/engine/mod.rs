mod availability;
mod catalog;
mod conflict;
mod error;
mod mutations;
mod planner;
mod pricing;
mod queries;
mod recurrence;
mod store;

pub use availability::{merge_booked_blocks, merge_ranges, split_block};
pub use catalog::{Catalog, CourtPricing};
pub use conflict::find_conflicts;
pub(crate) use conflict::now_ms;
pub use error::{EngineError, ValidationError};
pub use planner::ReservationRequest;
pub use pricing::{
    aligned_units_charge, day_type, overlap_sum_charge, resolve_price_row, PriceLookup,
};
pub use recurrence::{canonical_weekday, expand_dates, iso_to_canonical};
pub use store::{BookingRepository, CourtState};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedCourtState = Arc<RwLock<CourtState>>;

/// Tunables fixed for the lifetime of an engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Pricing granularity, in minutes.
    pub unit_minutes: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { unit_minutes: 30 }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed: {e}");
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The scheduling engine: catalog, per-court booking state and recurring rules.
///
/// Lock order is catalog first, then a single court. Every write holds the
/// court's write lock from the conflict check until the WAL record is durable
/// and applied, so two overlapping requests on one court serialize.
pub struct Engine {
    pub(super) catalog: RwLock<Catalog>,
    pub(super) courts: DashMap<Ulid, SharedCourtState>,
    pub(super) rules: DashMap<Ulid, RecurringRule>,
    /// Rule ids held by an in-flight `create_recurring`.
    pub(super) rule_claims: DashMap<Ulid, ()>,
    /// Reverse lookup: booking id → court id
    pub(super) booking_to_court: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) options: EngineOptions,
}

/// Apply a booking-level event to one court (caller holds the lock).
fn apply_to_court(
    cs: &mut CourtState,
    event: &Event,
    rules: &DashMap<Ulid, RecurringRule>,
    index: &DashMap<Ulid, Ulid>,
) {
    match event {
        Event::BookingsPlaced { rule, bookings, .. } => {
            if let Some(rule) = rule {
                rules.insert(rule.id, rule.clone());
            }
            for booking in bookings {
                index.insert(booking.id, booking.court_id);
                cs.save(booking.clone());
            }
        }
        Event::BookingStatusChanged {
            id,
            status,
            payment_ref,
            ..
        } => {
            if let Some(b) = cs.get_mut(*id) {
                b.status = *status;
                if payment_ref.is_some() {
                    b.payment_ref = payment_ref.clone();
                }
            }
        }
        Event::BookingExpired { id, .. } => {
            cs.delete(*id);
            index.remove(id);
        }
        _ => {}
    }
}

/// Court an event belongs to, for booking-level events.
fn event_court_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingsPlaced { court_id, .. }
        | Event::BookingStatusChanged { court_id, .. }
        | Event::BookingExpired { court_id, .. } => Some(*court_id),
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, options: EngineOptions) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut catalog = Catalog::new();
        let courts: DashMap<Ulid, SharedCourtState> = DashMap::new();
        let rules: DashMap<Ulid, RecurringRule> = DashMap::new();
        let booking_to_court = DashMap::new();

        // Sole owner of every Arc during replay, so try_write never contends.
        for event in &events {
            match event {
                Event::CourtCreated { court } => {
                    catalog.apply(event);
                    courts.insert(court.id, Arc::new(RwLock::new(CourtState::new(court.id))));
                }
                Event::RuleCancelled { id, updated_at } => {
                    if let Some(mut rule) = rules.get_mut(id) {
                        rule.status = RuleStatus::Cancelled;
                        rule.updated_at = *updated_at;
                    }
                }
                other => match event_court_id(other) {
                    Some(court_id) => {
                        if let Some(entry) = courts.get(&court_id)
                            && let Ok(mut guard) = entry.value().try_write()
                        {
                            apply_to_court(&mut guard, other, &rules, &booking_to_court);
                        }
                    }
                    None => catalog.apply(other),
                },
            }
        }
        tracing::debug!(events = events.len(), courts = courts.len(), "WAL replayed");

        Ok(Self {
            catalog: RwLock::new(catalog),
            courts,
            rules,
            rule_claims: DashMap::new(),
            booking_to_court,
            wal_tx,
            options,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_court_state(&self, id: &Ulid) -> Option<SharedCourtState> {
        self.courts.get(id).map(|e| e.value().clone())
    }

    pub fn court_of_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_court.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append then apply to the locked court.
    pub(super) async fn persist_and_apply(
        &self,
        cs: &mut CourtState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_court(cs, event, &self.rules, &self.booking_to_court);
        Ok(())
    }

    /// WAL-append then apply to the catalog (caller holds the write lock).
    pub(super) async fn persist_catalog(
        &self,
        catalog: &mut Catalog,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        catalog.apply(event);
        Ok(())
    }

    /// Lookup booking → court, acquire the court's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<CourtState>), EngineError> {
        let court_id = self
            .court_of_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let cs = self
            .get_court_state(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = cs.write_owned().await;
        Ok((court_id, guard))
    }
}
