use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::engine::{now_ms, Engine};
use crate::model::Ms;
use crate::observability;

/// One pass over every court. Returns how many PAYING bookings were removed.
/// A failure on one booking is logged and the pass moves on.
pub async fn sweep_once(engine: &Engine, now: Ms, grace_ms: Ms) -> usize {
    let mut reclaimed = 0;
    for (booking_id, court_id) in engine.collect_expired_payments(now, grace_ms) {
        match engine.expire_booking(booking_id, now, grace_ms).await {
            Ok(true) => {
                info!(%booking_id, %court_id, "reclaimed unpaid booking");
                reclaimed += 1;
            }
            // paid or cancelled since it was collected
            Ok(false) => {}
            Err(e) => {
                error!(%booking_id, %court_id, "sweeper failed to expire booking: {e}");
                metrics::counter!(observability::SWEEPER_ERRORS_TOTAL).increment(1);
            }
        }
    }
    if reclaimed > 0 {
        metrics::counter!(observability::SWEEPER_RECLAIMED_TOTAL).increment(reclaimed as u64);
    }
    reclaimed
}

/// Background task that reclaims PAYING bookings older than the grace window.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration, grace: Duration) {
    let grace_ms = Ms::try_from(grace.as_millis()).unwrap_or(Ms::MAX);
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_once(&engine, now_ms(), grace_ms).await;
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::model::*;
    use chrono::{NaiveDate, NaiveTime};
    use std::path::PathBuf;
    use ulid::Ulid;

    const MIN: Ms = 60_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtside_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    async fn court_with_evening_slot(engine: &Engine) -> Ulid {
        let group = Ulid::new();
        engine
            .create_group(CourtGroup {
                id: group,
                name: "Lakeside".into(),
                address: Address {
                    street: "1 Shore Rd".into(),
                    district: String::new(),
                    province: "Hue".into(),
                },
            })
            .await
            .unwrap();
        let court = Ulid::new();
        engine
            .create_court(Court { id: court, group_id: group, name: "Court 1".into() })
            .await
            .unwrap();
        engine
            .define_slot(TimeSlot { id: 1, range: TimeRange::new(t(17), t(22)) })
            .await
            .unwrap();
        engine
            .set_price(PriceRow {
                id: Ulid::new(),
                group_id: group,
                court_id: None,
                slot_id: 1,
                day_type: DayType::Weekday,
                unit_price: 50_000,
                effective_from: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                seq: 0,
            })
            .await
            .unwrap();
        court
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_unpaid_bookings() {
        let engine = Engine::new(test_wal_path("sweep_once.wal"), EngineOptions::default()).unwrap();
        let court = court_with_evening_slot(&engine).await;
        let date = NaiveDate::from_ymd_opt(2030, 1, 9).unwrap();

        let unpaid = Ulid::new();
        engine
            .create_booking(unpaid, "u1".into(), court, date, TimeRange::new(t(18), t(19)))
            .await
            .unwrap();
        let paid = Ulid::new();
        engine
            .create_booking(paid, "u2".into(), court, date, TimeRange::new(t(19), t(20)))
            .await
            .unwrap();
        engine.confirm_payment(paid, "slip-1".into()).await.unwrap();

        let now = now_ms();
        assert_eq!(sweep_once(&engine, now, 5 * MIN).await, 0);
        assert_eq!(sweep_once(&engine, now + 6 * MIN, 5 * MIN).await, 1);

        let left = engine.list_bookings(court, date).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, paid);
        assert_eq!(left[0].status, BookingStatus::Confirmed);

        // nothing left to reclaim
        assert_eq!(sweep_once(&engine, now + 60 * MIN, 5 * MIN).await, 0);
    }

    #[tokio::test]
    async fn sweeper_task_runs_on_interval() {
        let engine = Arc::new(
            Engine::new(test_wal_path("sweep_task.wal"), EngineOptions::default()).unwrap(),
        );
        let court = court_with_evening_slot(&engine).await;
        let date = NaiveDate::from_ymd_opt(2030, 1, 9).unwrap();
        engine
            .create_booking(Ulid::new(), "u1".into(), court, date, TimeRange::new(t(18), t(19)))
            .await
            .unwrap();

        // zero grace: the first tick already sees the booking as stale
        let task = tokio::spawn(run_sweeper(engine.clone(), Duration::from_secs(60), Duration::ZERO));
        for _ in 0..200 {
            if engine.list_bookings(court, date).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.list_bookings(court, date).await.unwrap().is_empty());
        task.abort();
    }
}
