use std::net::SocketAddr;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use boardledger::tenant::TenantManager;
use boardledger::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("boardledger_int_test_{}", Ulid::new()));
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
                let _ = wire::process_connection(socket, tm, "boardledger".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("agency")
        .password("boardledger");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

/// A billboard with no campaign minimum or notice, so far-future dates are always bookable.
async fn billboard(client: &Client, owner: Ulid, price: u32) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO billboards VALUES ('{id}', '{owner}', false, {price}, 0, 0, true, NULL)"
        ))
        .await
        .unwrap();
    id
}

async fn submit(client: &Client, billboard: Ulid, requester: Ulid, start: &str, end: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, billboard_id, requester_id, start, "end") VALUES ('{id}', '{billboard}', '{requester}', '{start}', '{end}')"#
        ))
        .await
        .unwrap();
    id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_list_billboards() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "listing").await;

    let owner = Ulid::new();
    let id = billboard(&client, owner, 30_000).await;

    let found = rows(&client, "SELECT * FROM billboards").await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("id"), Some(id.to_string().as_str()));
    assert_eq!(found[0].get("owner_id"), Some(owner.to_string().as_str()));
    assert_eq!(found[0].get("base_price_monthly"), Some("30000"));
}

#[tokio::test]
async fn duplicate_billboard_is_unique_violation() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "duplicates").await;

    let owner = Ulid::new();
    let id = billboard(&client, owner, 1000).await;
    let err = client
        .batch_execute(&format!("INSERT INTO billboards VALUES ('{id}', '{owner}', false, 1000)"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23505"));
}

#[tokio::test]
async fn approve_then_conflicting_approve() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "approvals").await;

    let owner = Ulid::new();
    let bb = billboard(&client, owner, 30_000).await;
    let first = submit(&client, bb, Ulid::new(), "2030-03-01", "2030-03-31").await;
    let second = submit(&client, bb, Ulid::new(), "2030-03-15", "2030-04-15").await;

    client
        .batch_execute(&format!("INSERT INTO booking_approvals VALUES ('{first}', '{owner}')"))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!("INSERT INTO booking_approvals VALUES ('{second}', '{owner}')"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    let booking = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{second}'")).await;
    assert_eq!(booking[0].get("status"), Some("pending"));

    let booking = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{first}'")).await;
    assert_eq!(booking[0].get("status"), Some("approved"));
    assert_eq!(booking[0].get("phase"), Some("upcoming"));

    let blocks = rows(&client, &format!("SELECT * FROM blocked_dates WHERE booking_id = '{first}'")).await;
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].get("start"), Some("2030-03-01"));
}

#[tokio::test]
async fn day_status_reports_precedence() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "calendar").await;

    let owner = Ulid::new();
    let bb = billboard(&client, owner, 30_000).await;
    let booking = submit(&client, bb, Ulid::new(), "2030-06-10", "2030-06-12").await;

    let ovr = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO pricing_overrides VALUES ('{ovr}', '{bb}', '{owner}', '2030-06-01', '2030-06-30', 45000, 'summer')"#
        ))
        .await
        .unwrap();
    let block = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO blocked_dates VALUES ('{block}', '{bb}', '{owner}', '2030-06-20', '2030-06-21', 'maintenance')"#
        ))
        .await
        .unwrap();

    let days = rows(
        &client,
        &format!(r#"SELECT * FROM day_status WHERE billboard_id = '{bb}' AND start >= '2030-06-09' AND "end" <= '2030-06-20'"#),
    )
    .await;
    assert_eq!(days.len(), 12);
    assert_eq!(days[0].get("day"), Some("2030-06-09"));
    assert_eq!(days[0].get("status"), Some("priced"));
    assert_eq!(days[0].get("price_monthly"), Some("45000"));
    assert_eq!(days[1].get("status"), Some("booked"));
    assert_eq!(days[1].get("entry_id"), Some(booking.to_string().as_str()));
    assert_eq!(days[1].get("booking_status"), Some("pending"));
    assert_eq!(days[11].get("status"), Some("blocked"));
    assert_eq!(days[11].get("entry_id"), Some(block.to_string().as_str()));

    let single = rows(
        &client,
        &format!("SELECT * FROM day_status WHERE billboard_id = '{bb}' AND day = '2030-07-01'"),
    )
    .await;
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].get("status"), Some("default"));
}

#[tokio::test]
async fn quote_prorates_monthly_rate() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "quotes").await;

    let bb = billboard(&client, Ulid::new(), 30_000).await;
    let quote = rows(
        &client,
        &format!(r#"SELECT * FROM quotes WHERE billboard_id = '{bb}' AND start = '2030-03-01' AND "end" = '2030-03-16'"#),
    )
    .await;
    assert_eq!(quote.len(), 1);
    assert_eq!(quote[0].get("days"), Some("15"));
    let total: Decimal = quote[0].get("total_price").unwrap().parse().unwrap();
    assert_eq!(total, Decimal::from(15_000));
}

#[tokio::test]
async fn policy_violations_are_invalid_parameter() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "validation").await;

    let bb = billboard(&client, Ulid::new(), 30_000).await;
    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO bookings VALUES ('{}', '{bb}', '{}', '2030-03-10', '2030-03-01')"#,
            Ulid::new(),
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));
}

#[tokio::test]
async fn only_the_owner_may_approve() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "permissions").await;

    let bb = billboard(&client, Ulid::new(), 30_000).await;
    let requester = Ulid::new();
    let booking = submit(&client, bb, requester, "2030-03-01", "2030-03-31").await;

    let err = client
        .batch_execute(&format!("INSERT INTO booking_approvals VALUES ('{booking}', '{requester}')"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));
}

#[tokio::test]
async fn unknown_booking_is_not_found() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "missing").await;

    let err = client
        .batch_execute(&format!("INSERT INTO booking_cancellations VALUES ('{}', '{}')", Ulid::new(), Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));
}

#[tokio::test]
async fn malformed_sql_is_syntax_error() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "syntax").await;

    let err = client.batch_execute("INSERT INTO nowhere VALUES (1)").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
}

#[tokio::test]
async fn tenants_do_not_share_billboards() {
    let (addr, _tm) = start_test_server().await;
    let a = connect(addr, "agency_a").await;
    let b = connect(addr, "agency_b").await;

    billboard(&a, Ulid::new(), 30_000).await;
    assert_eq!(rows(&a, "SELECT * FROM billboards").await.len(), 1);
    assert!(rows(&b, "SELECT * FROM billboards").await.is_empty());
}

#[tokio::test]
async fn extended_query_binds_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "extended").await;

    let bb = billboard(&client, Ulid::new(), 30_000).await;
    let booking = submit(&client, bb, Ulid::new(), "2030-03-01", "2030-03-31").await;

    let found = client
        .query("SELECT * FROM bookings WHERE id = $1", &[&booking.to_string()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let status: &str = found[0].get("status");
    assert_eq!(status, "pending");
}
