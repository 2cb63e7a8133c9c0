use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Datelike, Duration, NaiveDate, Utc, Weekday};
use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use slotd::tenant::TenantManager;
use slotd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotd".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("slotd")
        .password("slotd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// A Monday at least three days out, so every booking is in the future and
/// outside the 24-hour cancellation fence.
fn future_monday() -> NaiveDate {
    let mut d = Utc::now().date_naive() + Duration::days(3);
    while d.weekday() != Weekday::Mon {
        d += Duration::days(1);
    }
    d
}

fn data_rows(messages: &[SimpleQueryMessage]) -> Vec<&tokio_postgres::SimpleQueryRow> {
    messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn create_expert(client: &tokio_postgres::Client) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO experts VALUES ('{id}', 'Nadia', 'TAX', 120, '09:00', '17:00', '1,2,3,4,5', 4.0)"
        ))
        .await
        .unwrap();
    id
}

async fn create_purchase(
    client: &tokio_postgres::Client,
    expert_id: Ulid,
    hours: i64,
) -> (Ulid, Ulid) {
    let purchase_id = Ulid::new();
    let user_id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO purchases VALUES ('{purchase_id}', '{user_id}', '{expert_id}', {hours})"
        ))
        .await
        .unwrap();
    (purchase_id, user_id)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn connect_and_list_experts() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "experts_db").await;

    let eid = create_expert(&client).await;

    let messages = client.simple_query("SELECT * FROM experts").await.unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(eid.to_string().as_str()));
    assert_eq!(rows[0].get(1), Some("Nadia"));
    assert_eq!(rows[0].get(2), Some("TAX"));
    assert_eq!(rows[0].get(3), Some("120"));
    // rating is FLOAT8; base_rating 4.0 with no feedback yet
    assert_eq!(rows[0].get(6), Some("4.0"));
}

#[tokio::test]
async fn full_booking_flow() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "booking_db").await;

    let eid = create_expert(&client).await;
    let (pid, uid) = create_purchase(&client, eid, 1).await;
    let monday = future_monday();

    // 16 open slots on a default workday
    let messages = client
        .simple_query(&format!(
            "SELECT * FROM slots WHERE expert_id = '{eid}' AND date = '{monday}'"
        ))
        .await
        .unwrap();
    assert_eq!(data_rows(&messages).len(), 16);

    // Book two slots in one atomic batch
    client
        .batch_execute(&format!(
            "INSERT INTO sessions VALUES ('{pid}', '{uid}', '{monday}', 540, 570), ('{pid}', '{uid}', '{monday}', 570, 600)"
        ))
        .await
        .unwrap();

    let messages = client
        .simple_query(&format!(
            "SELECT * FROM sessions WHERE purchase_id = '{pid}'"
        ))
        .await
        .unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.get(7) == Some("UPCOMING")));
    let first_session = rows[0].get(0).unwrap().to_string();

    // Balance exhausted
    let messages = client
        .simple_query(&format!("SELECT * FROM purchases WHERE user_id = '{uid}'"))
        .await
        .unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows[0].get(4), Some("0"));

    // Cancel one session; the refund restores 30 minutes and frees the slot
    client
        .batch_execute(&format!(
            "UPDATE sessions SET cancelled_by = '{uid}', cancel_reason = 'conflict' WHERE id = '{first_session}'"
        ))
        .await
        .unwrap();

    let messages = client
        .simple_query(&format!("SELECT * FROM purchases WHERE user_id = '{uid}'"))
        .await
        .unwrap();
    assert_eq!(data_rows(&messages)[0].get(4), Some("30"));

    let messages = client
        .simple_query(&format!(
            "SELECT * FROM slots WHERE expert_id = '{eid}' AND date = '{monday}'"
        ))
        .await
        .unwrap();
    assert_eq!(data_rows(&messages).len(), 15);
}

#[tokio::test]
async fn engine_errors_surface_as_p0001() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "errors_db").await;

    let eid = create_expert(&client).await;
    let (pid, uid) = create_purchase(&client, eid, 1).await;
    let monday = future_monday();

    // Three slots against a one-hour package
    let err = client
        .batch_execute(&format!(
            "INSERT INTO sessions VALUES \
             ('{pid}', '{uid}', '{monday}', 540, 570), \
             ('{pid}', '{uid}', '{monday}', 570, 600), \
             ('{pid}', '{uid}', '{monday}', 600, 630)"
        ))
        .await
        .unwrap_err();
    let db_err = err.as_db_error().unwrap();
    assert_eq!(db_err.code().code(), "P0001");
    assert!(db_err.message().contains("insufficient balance"));
}

#[tokio::test]
async fn sql_errors_surface_as_42601() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "sql_errors_db").await;

    let err = client
        .batch_execute(&format!("INSERT INTO nowhere VALUES ('{}')", Ulid::new()))
        .await
        .unwrap_err();
    let db_err = err.as_db_error().unwrap();
    assert_eq!(db_err.code().code(), "42601");
}

#[tokio::test]
async fn override_closes_a_day_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "override_db").await;

    let eid = create_expert(&client).await;
    let monday = future_monday();

    let ov = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO overrides VALUES ('{ov}', '{eid}', '{monday}', false, NULL, NULL)"
        ))
        .await
        .unwrap();

    let messages = client
        .simple_query(&format!(
            "SELECT * FROM slots WHERE expert_id = '{eid}' AND date = '{monday}'"
        ))
        .await
        .unwrap();
    assert!(data_rows(&messages).is_empty());

    client
        .batch_execute(&format!("DELETE FROM overrides WHERE id = '{ov}'"))
        .await
        .unwrap();
    let messages = client
        .simple_query(&format!(
            "SELECT * FROM slots WHERE expert_id = '{eid}' AND date = '{monday}'"
        ))
        .await
        .unwrap();
    assert_eq!(data_rows(&messages).len(), 16);
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "extended_db").await;

    let id = Ulid::new();
    let rows = client
        .execute(
            "INSERT INTO experts (id, name, domain, hourly_rate) VALUES ($1, $2, 'CYBER', 150)",
            &[&id.to_string(), &"Iris"],
        )
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let messages = client.simple_query("SELECT * FROM experts").await.unwrap();
    let rows = data_rows(&messages);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(1), Some("Iris"));
}

#[tokio::test]
async fn tenants_are_isolated_by_database_name() {
    let (addr, _tm) = start_test_server().await;
    let client_a = connect(addr, "tenant_a").await;
    let client_b = connect(addr, "tenant_b").await;

    create_expert(&client_a).await;

    let messages = client_b.simple_query("SELECT * FROM experts").await.unwrap();
    assert!(data_rows(&messages).is_empty());

    let messages = client_a.simple_query("SELECT * FROM experts").await.unwrap();
    assert_eq!(data_rows(&messages).len(), 1);
}
