use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use citystage::config::SchedulingConfig;
use citystage::engine::Engine;
use citystage::notify::NotifyHub;
use citystage::wire;

const PASSWORD: &str = "citystage";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("citystage_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(
            dir.join("citystage.wal"),
            Arc::new(NotifyHub::new()),
            SchedulingConfig::default(),
        )
        .unwrap(),
    );

    let served = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = served.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("citystage")
        .user("bot")
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn query_rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    rows(client.simple_query(sql).await.unwrap())
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.as_db_error().map(|e| e.code().code())
}

fn tomorrow() -> NaiveDate {
    Utc::now().date_naive().checked_add_days(Days::new(1)).unwrap()
}

/// A location plus a verified speaker.
async fn seed(client: &Client) -> (Ulid, Ulid) {
    let lid = Ulid::new();
    let uid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO locations (id, address, img) VALUES ('{lid}', 'Невский пр., 28', 'nevsky.jpg');
             INSERT INTO users (id, name, verified) VALUES ('{uid}', 'Анна', true);"
        ))
        .await
        .unwrap();
    (lid, uid)
}

async fn book(client: &Client, uid: Ulid, lid: Ulid, date: NaiveDate, time: &str, hours: u8) -> SimpleQueryRow {
    let mut result = query_rows(
        client,
        &format!(
            "INSERT INTO bookings (user_id, location_id, date, time, duration_hours) \
             VALUES ('{uid}', '{lid}', '{date}', '{time}', {hours})"
        ),
    )
    .await;
    assert_eq!(result.len(), 1);
    result.remove(0)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn directory_round_trip() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (lid, uid) = seed(&client).await;

    let locations = query_rows(&client, "SELECT * FROM locations").await;
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].get("id"), Some(lid.to_string().as_str()));
    assert_eq!(locations[0].get("address"), Some("Невский пр., 28"));

    client
        .batch_execute(&format!(
            "UPDATE locations SET address = 'Литейный пр., 7' WHERE id = '{lid}'"
        ))
        .await
        .unwrap();
    let locations = query_rows(&client, &format!("SELECT * FROM locations WHERE id = '{lid}'")).await;
    assert_eq!(locations[0].get("address"), Some("Литейный пр., 7"));

    let users = query_rows(&client, &format!("SELECT * FROM users WHERE id = '{uid}'")).await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].get("name"), Some("Анна"));
    assert_eq!(users[0].get("verified"), Some("t"));
    assert_eq!(users[0].get("in_cooldown"), Some("f"));

    let missing = query_rows(&client, &format!("SELECT * FROM users WHERE id = '{}'", Ulid::new())).await;
    assert!(missing.is_empty());
}

#[tokio::test]
async fn duplicate_location_is_unique_violation() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (lid, _) = seed(&client).await;

    let err = assert_err!(
        client
            .batch_execute(&format!("INSERT INTO locations (id, address) VALUES ('{lid}', 'again')"))
            .await
    );
    assert_eq!(sqlstate(&err), Some("23505"));
}

#[tokio::test]
async fn booking_accepted_then_overlap_rejected() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let (lid, uid) = seed(&client).await;
    let day = tomorrow();

    let accepted = book(&client, uid, lid, day, "14:00", 1).await;
    assert_eq!(accepted.get("accepted"), Some("t"));
    assert_eq!(accepted.get("message"), Some("Бронирование успешно создано"));
    let id: Ulid = accepted.get("id").unwrap().parse().unwrap();
    assert!(engine.get_booking(&id).await.is_some());

    let other = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO users VALUES ('{other}', 'Борис', true)"))
        .await
        .unwrap();
    let rejected = book(&client, other, lid, day, "13:00", 2).await;
    assert_eq!(rejected.get("accepted"), Some("f"));
    assert_eq!(rejected.get("id"), None);
    let message = rejected.get("message").unwrap();
    assert!(message.starts_with("Выбранное время пересекается с существующим бронированием."));
    assert!(message.contains("13:00–14:00 (1 час)"), "{message}");

    let touching = book(&client, other, lid, day, "15:00", 1).await;
    assert_eq!(touching.get("accepted"), Some("t"));

    let listed = query_rows(
        &client,
        &format!("SELECT * FROM bookings WHERE location_id = '{lid}' AND date = '{day}'"),
    )
    .await;
    let times: Vec<_> = listed.iter().map(|r| r.get("time").unwrap().to_string()).collect();
    assert_eq!(times, ["14:00", "15:00"]);
    assert_eq!(listed[0].get("location_address"), Some("Невский пр., 28"));
}

#[tokio::test]
async fn unverified_speaker_is_rejected_on_empty_day() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (lid, _) = seed(&client).await;
    let uid = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO users (id, name) VALUES ('{uid}', 'Вера')"))
        .await
        .unwrap();

    let row = book(&client, uid, lid, tomorrow(), "10:00", 1).await;
    assert_eq!(row.get("accepted"), Some("f"));
    assert!(row.get("message").unwrap().contains("не подтвержден"));

    client
        .batch_execute(&format!("UPDATE users SET verified = true WHERE id = '{uid}'"))
        .await
        .unwrap();
    let row = book(&client, uid, lid, tomorrow(), "10:00", 1).await;
    assert_eq!(row.get("accepted"), Some("t"));
}

#[tokio::test]
async fn malformed_requests_are_invalid_parameter_values() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (lid, uid) = seed(&client).await;
    let insert = |date: NaiveDate, time: &str, hours: u8| {
        format!(
            "INSERT INTO bookings (user_id, location_id, date, time, duration_hours) \
             VALUES ('{uid}', '{lid}', '{date}', '{time}', {hours})"
        )
    };

    for sql in [
        insert(tomorrow(), "14:30", 1),
        insert(tomorrow(), "08:00", 1),
        insert(tomorrow(), "20:00", 2),
        insert(tomorrow(), "12:00", 3),
        insert(tomorrow(), "71582788:00", 1),
        insert(tomorrow(), "+10:00", 1),
        insert(tomorrow(), "020:00", 1),
        insert(Utc::now().date_naive().checked_sub_days(Days::new(1)).unwrap(), "12:00", 1),
        insert(Utc::now().date_naive().checked_add_days(Days::new(60)).unwrap(), "12:00", 1),
    ] {
        let err = assert_err!(client.simple_query(&sql).await);
        assert_eq!(sqlstate(&err), Some("22023"), "{sql}");
    }

    let err = assert_err!(client.simple_query("SELECT * FROM rooms").await);
    assert_eq!(sqlstate(&err), Some("42601"));
}

#[tokio::test]
async fn single_digit_hour_is_listed_zero_padded() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (lid, uid) = seed(&client).await;
    let day = tomorrow();

    let row = book(&client, uid, lid, day, "9:00", 1).await;
    assert_eq!(row.get("accepted"), Some("t"));
    let listed = query_rows(
        &client,
        &format!("SELECT * FROM bookings WHERE location_id = '{lid}' AND date = '{day}'"),
    )
    .await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("time"), Some("09:00"));
}

#[tokio::test]
async fn admin_lists_and_deletes_users() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let (lid, uid) = seed(&client).await;
    let other = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO users (id, name) VALUES ('{other}', 'Борис')"))
        .await
        .unwrap();
    let day = tomorrow();
    book(&client, uid, lid, day, "10:00", 1).await;

    let users = query_rows(&client, "SELECT * FROM users").await;
    let names: Vec<_> = users.iter().map(|u| u.get("name")).collect();
    assert_eq!(names, vec![Some("Анна"), Some("Борис")]);

    assert_ok!(client.batch_execute(&format!("DELETE FROM users WHERE id = '{uid}'")).await);
    let users = query_rows(&client, "SELECT * FROM users").await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].get("id"), Some(other.to_string().as_str()));
    assert!(engine.list_bookings(lid, day).await.is_empty());

    let err = assert_err!(client.batch_execute(&format!("DELETE FROM users WHERE id = '{uid}'")).await);
    assert_eq!(sqlstate(&err), Some("P0002"));
}

#[tokio::test]
async fn schedule_and_suggestions_tables() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let (lid, uid) = seed(&client).await;
    let day = tomorrow();
    book(&client, uid, lid, day, "14:00", 1).await;

    let slots = query_rows(
        &client,
        &format!("SELECT * FROM schedule WHERE location_id = '{lid}' AND date = '{day}'"),
    )
    .await;
    assert_eq!(slots.len(), 14);
    assert_eq!(slots[0].get("time"), Some("09:00"));
    let busy = slots.iter().find(|s| s.get("hour") == Some("14")).unwrap();
    assert_eq!(busy.get("occupied"), Some("t"));
    assert!(busy.get("booking_id").is_some());

    let suggestions = query_rows(
        &client,
        &format!(
            "SELECT * FROM suggestions WHERE location_id = '{lid}' AND date = '{day}' \
             AND time = '14:00' AND duration_hours = 1"
        ),
    )
    .await;
    assert!(!suggestions.is_empty() && suggestions.len() <= 5);
    assert!(suggestions.iter().all(|s| s.get("start_time") != Some("14:00")));

    let err = assert_err!(
        client
            .simple_query(&format!(
                "SELECT * FROM schedule WHERE location_id = '{}' AND date = '{day}'",
                Ulid::new()
            ))
            .await
    );
    assert_eq!(sqlstate(&err), Some("P0002"));
}

#[tokio::test]
async fn cancel_requires_owner_and_admin_delete_does_not() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let (lid, uid) = seed(&client).await;
    let day = tomorrow();

    let first: Ulid = book(&client, uid, lid, day, "10:00", 1).await.get("id").unwrap().parse().unwrap();
    let second: Ulid = book(&client, uid, lid, day, "12:00", 1).await.get("id").unwrap().parse().unwrap();

    let err = assert_err!(
        client
            .batch_execute(&format!(
                "DELETE FROM bookings WHERE id = '{first}' AND user_id = '{}'",
                Ulid::new()
            ))
            .await
    );
    assert_eq!(sqlstate(&err), Some("42501"));

    assert_ok!(
        client
            .batch_execute(&format!("DELETE FROM bookings WHERE id = '{first}' AND user_id = '{uid}'"))
            .await
    );
    assert_ok!(client.batch_execute(&format!("DELETE FROM bookings WHERE id = '{second}'")).await);

    assert!(engine.list_bookings(lid, day).await.is_empty());
    let mine = query_rows(&client, &format!("SELECT * FROM bookings WHERE user_id = '{uid}'")).await;
    assert!(mine.is_empty());
}

#[tokio::test]
async fn extended_protocol_binds_text_parameters() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let (lid, uid) = seed(&client).await;
    let day = tomorrow().to_string();
    let (lid_s, uid_s) = (lid.to_string(), uid.to_string());

    let rows = client
        .query(
            "INSERT INTO bookings (user_id, location_id, date, time, duration_hours) \
             VALUES ($1, $2, $3, $4, $5)",
            &[&uid_s, &lid_s, &day, &"11:00", &"2"],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let id: String = rows[0].get("id");
    let message: String = rows[0].get("message");
    assert_eq!(message, "Бронирование успешно создано");

    client
        .execute("UPDATE bookings SET time = $1, duration_hours = $2 WHERE id = $3", &[&"16:00", &"1", &id])
        .await
        .unwrap();
    let booking = engine.get_booking(&id.parse().unwrap()).await.unwrap();
    assert_eq!((booking.time.as_str(), booking.duration_hours), ("16:00", 1));

    let rows = client
        .query("SELECT * FROM bookings WHERE id = $1", &[&id])
        .await
        .unwrap();
    let time: String = rows[0].get("time");
    assert_eq!(time, "16:00");
}

#[tokio::test]
async fn settings_update_and_list() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;

    let settings = query_rows(&client, "SELECT * FROM settings").await;
    assert_eq!(settings.len(), 1);
    assert_eq!(settings[0].get("key"), Some("cooldown_days"));
    assert_eq!(settings[0].get("value"), Some("2"));

    assert_ok!(
        client
            .batch_execute("UPDATE settings SET value = '3' WHERE key = 'cooldown_days'")
            .await
    );
    assert_eq!(engine.get_setting("cooldown_days").as_deref(), Some("3"));

    let err = assert_err!(
        client
            .batch_execute("UPDATE settings SET value = 'soon' WHERE key = 'cooldown_days'")
            .await
    );
    assert_eq!(sqlstate(&err), Some("22023"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_inserts_accept_exactly_one() {
    let (addr, engine) = start_test_server().await;
    let admin = connect(addr).await;
    let (lid, _) = seed(&admin).await;
    let day = tomorrow();

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let uid = Ulid::new();
        admin
            .batch_execute(&format!("INSERT INTO users VALUES ('{uid}', 'speaker {i}', true)"))
            .await
            .unwrap();
        tasks.push(tokio::spawn(async move {
            let client = connect(addr).await;
            let time = if i % 2 == 0 { "14:00" } else { "13:00" };
            let hours = if i % 2 == 0 { 1 } else { 2 };
            let row = book(&client, uid, lid, day, time, hours).await;
            row.get("accepted") == Some("t")
        }));
    }

    let mut accepted = 0;
    for task in tasks {
        if task.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(engine.list_bookings(lid, day).await.len(), 1);
}
