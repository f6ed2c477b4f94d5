use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use courtside::engine::{Engine, EngineOptions};
use courtside::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("courtside_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("courtside.wal"), EngineOptions::default()).unwrap());

    let served = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = served.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "courtside".to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect_with(addr: SocketAddr, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("courtside")
        .user("courtside")
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> Client {
    connect_with(addr, "courtside").await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

struct Venue {
    group: Ulid,
    court: Ulid,
}

/// Group with one court, hourly slots 17:00-22:00 (ids 1..5) priced 50,000
/// per half hour on weekdays.
async fn seed(client: &Client) -> Venue {
    let group = Ulid::new();
    let court = Ulid::new();
    client
        .execute(
            "INSERT INTO court_groups (id, name, street, district, province) VALUES ($1, $2, $3, $4, $5)",
            &[&group.to_string(), &"Riverside", &"12 Tran Phu", &"Hai Chau", &"Da Nang"],
        )
        .await
        .unwrap();
    client
        .execute(
            "INSERT INTO courts (id, group_id, name) VALUES ($1, $2, $3)",
            &[&court.to_string(), &group.to_string(), &"Court A"],
        )
        .await
        .unwrap();
    for (id, hour) in (1..=5).zip(17..22) {
        client
            .simple_query(&format!(
                "INSERT INTO time_slots (id, start_time, end_time) VALUES ({id}, '{hour}:00', '{}:00')",
                hour + 1
            ))
            .await
            .unwrap();
        client
            .simple_query(&format!(
                "INSERT INTO prices (id, group_id, court_id, slot_id, day_type, unit_price, effective_from) \
                 VALUES ('{}', '{group}', NULL, {id}, 'WEEKDAY', 50000, '2026-01-01')",
                Ulid::new()
            ))
            .await
            .unwrap();
    }
    Venue { group, court }
}

fn recurring_filters(court: Ulid) -> String {
    format!(
        "court_id = '{court}' AND start_date = '2030-01-07' AND end_date = '2030-01-20' \
         AND weekdays = '1,3' AND start_time = '18:00' AND end_time = '19:00'"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn recurring_booking_end_to_end() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let venue = seed(&client).await;

    let preview = rows(
        &client,
        &format!("SELECT * FROM price_preview WHERE {}", recurring_filters(venue.court)),
    )
    .await;
    assert_eq!(preview.len(), 4);
    assert_eq!(preview[0].get("date"), Some("2030-01-07"));
    assert_eq!(preview[0].get("price"), Some("100000"));
    assert_eq!(preview[0].get("weekday_unit_price"), Some("50000"));
    assert_eq!(preview[0].get("total_price"), Some("400000"));

    let conflicts = rows(
        &client,
        &format!("SELECT * FROM conflicts WHERE {}", recurring_filters(venue.court)),
    )
    .await;
    assert!(conflicts.is_empty());

    let rule = Ulid::new();
    let created = client
        .execute(
            "INSERT INTO recurring_bookings (id, user_id, court_id, start_date, end_date, weekdays, start_time, end_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &rule.to_string(),
                &"owner-1",
                &venue.court.to_string(),
                &"2030-01-07",
                &"2030-01-20",
                &"1,3",
                &"18:00",
                &"19:00",
            ],
        )
        .await
        .unwrap();
    assert_eq!(created, 4);

    let conflicts = rows(
        &client,
        &format!("SELECT * FROM conflicts WHERE {}", recurring_filters(venue.court)),
    )
    .await;
    assert_eq!(conflicts.len(), 4);
    assert_eq!(conflicts[0].get("court_name"), Some("Court A"));

    // the same pattern again is refused with the full conflict list
    let err = client
        .simple_query(&format!(
            "INSERT INTO recurring_bookings (id, user_id, court_id, start_date, end_date, weekdays, start_time, end_time) \
             VALUES ('{}', 'owner-2', '{}', '2030-01-07', '2030-01-20', '1,3', '18:00', '19:00')",
            Ulid::new(),
            venue.court
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");
    let message = err.as_db_error().map(|e| e.message().to_string()).unwrap_or_default();
    assert!(message.contains("\"date\":\"2030-01-09\""));

    let bookings = rows(
        &client,
        &format!("SELECT * FROM bookings WHERE court_id = '{}' AND date = '2030-01-09'", venue.court),
    )
    .await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].get("status"), Some("CONFIRMED"));
    assert_eq!(bookings[0].get("rule_id"), Some(rule.to_string().as_str()));
    assert_eq!(bookings[0].get("address"), Some("12 Tran Phu, Hai Chau, Da Nang"));

    client
        .simple_query(&format!("DELETE FROM recurring_bookings WHERE id = '{rule}'"))
        .await
        .unwrap();
    let listed = rows(&client, &format!("SELECT * FROM recurring_bookings WHERE id = '{rule}'")).await;
    assert_eq!(listed[0].get("status"), Some("CANCELLED"));
    assert_eq!(listed[0].get("weekdays"), Some("1,3"));
}

#[tokio::test]
async fn reservation_payment_and_availability() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let venue = seed(&client).await;

    let preview = rows(
        &client,
        &format!(
            "SELECT * FROM booking_preview WHERE group_id = '{}' AND court_id = '{}' \
             AND date = '2030-01-08' AND ranges = '18:00-18:30,18:30-19:00'",
            venue.group, venue.court
        ),
    )
    .await;
    assert_eq!(preview.len(), 1);
    assert_eq!(preview[0].get("start_time"), Some("18:00"));
    assert_eq!(preview[0].get("end_time"), Some("19:00"));
    assert_eq!(preview[0].get("total_price"), Some("100000"));

    let (first, second) = (Ulid::new(), Ulid::new());
    let placed = client
        .execute(
            "INSERT INTO bookings (id, user_id, court_id, date, start_time, end_time) VALUES \
             ($1, $3, $4, $5, '18:00', '19:00'), ($2, $3, $4, $5, '19:00', '19:30')",
            &[
                &first.to_string(),
                &second.to_string(),
                &"player-7",
                &venue.court.to_string(),
                &"2030-01-08",
            ],
        )
        .await
        .unwrap();
    assert_eq!(placed, 2);

    let availability = rows(
        &client,
        &format!("SELECT * FROM availability WHERE group_id = '{}' AND date = '2030-01-08'", venue.group),
    )
    .await;
    let booked: Vec<_> = availability
        .iter()
        .filter(|r| r.get("kind") == Some("booked"))
        .collect();
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("start_time"), Some("18:00"));
    assert_eq!(booked[0].get("end_time"), Some("19:30"));
    assert_eq!(booked[0].get("slot_ids"), Some("2,3"));
    assert_eq!(booked[0].get("price"), Some("150000"));
    assert_eq!(
        availability.iter().filter(|r| r.get("kind") == Some("priced")).count(),
        5
    );

    // completing before payment is an invalid transition
    let err = client
        .simple_query(&format!("INSERT INTO completions (booking_id) VALUES ('{first}')"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "55000");

    for id in [first, second] {
        client
            .simple_query(&format!(
                "INSERT INTO payments (booking_id, proof_ref) VALUES ('{id}', 'slip-{id}')"
            ))
            .await
            .unwrap();
    }
    client
        .simple_query(&format!("INSERT INTO completions (booking_id) VALUES ('{first}')"))
        .await
        .unwrap();

    let revenue = rows(
        &client,
        &format!(
            "SELECT * FROM revenue WHERE group_id = '{}' AND start_date = '2030-01-01' AND end_date = '2030-01-31'",
            venue.group
        ),
    )
    .await;
    assert_eq!(revenue[0].get("revenue"), Some("150000"));
    assert_eq!(revenue[0].get("previous_revenue"), Some("0"));
    assert_eq!(revenue[0].get("bookings"), Some("2"));
    let growth: f64 = revenue[0].get("growth_percent").unwrap().parse().unwrap();
    assert_eq!(growth, 100.0);
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let venue = seed(&client).await;

    let err = client.simple_query("SELEC nonsense").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");

    let err = client
        .simple_query(&format!(
            "SELECT * FROM bookings WHERE court_id = '{}' AND date = '2030-01-08'",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "02000");

    // empty weekday set
    let err = client
        .simple_query(&format!(
            "SELECT * FROM conflicts WHERE court_id = '{}' AND start_date = '2030-01-07' \
             AND end_date = '2030-01-20' AND weekdays = '' AND start_time = '18:00' AND end_time = '19:00'",
            venue.court
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22023");

    // start in the past
    let err = client
        .simple_query(&format!(
            "SELECT * FROM price_preview WHERE court_id = '{}' AND start_date = '2001-01-01' \
             AND end_date = '2001-01-20' AND weekdays = '1' AND start_time = '18:00' AND end_time = '19:00'",
            venue.court
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "22023");
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let (addr, _engine) = start_test_server().await;
    assert!(connect_with(addr, "not-the-password").await.is_err());
}

#[tokio::test]
async fn state_survives_engine_restart() {
    let dir = std::env::temp_dir().join(format!("courtside_int_restart_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let wal = dir.join("courtside.wal");
    let court;
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let engine = Arc::new(Engine::new(wal.clone(), EngineOptions::default()).unwrap());
        let served = engine.clone();
        let server = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let engine = served.clone();
                tokio::spawn(async move {
                    let _ = wire::process_connection(socket, engine, "courtside".to_string(), None).await;
                });
            }
        });
        let client = connect(addr).await;
        let venue = seed(&client).await;
        court = venue.court;
        client
            .simple_query(&format!(
                "INSERT INTO bookings (id, user_id, court_id, date, start_time, end_time) \
                 VALUES ('{}', 'p1', '{court}', '2030-01-08', '20:00', '21:00')",
                Ulid::new()
            ))
            .await
            .unwrap();
        server.abort();
    }

    let engine = Engine::new(wal, EngineOptions::default()).unwrap();
    let date = chrono::NaiveDate::from_ymd_opt(2030, 1, 8).unwrap();
    let bookings = engine.list_bookings(court, date).await.unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].price, 100_000);
}
