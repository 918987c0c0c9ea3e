use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use roster::tenant::TenantManager;
use roster::wire;

const HOUR: i64 = 3_600_000;
const DAY: i64 = 86_400_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roster_int_test_{}", Ulid::new()));
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
                let _ = wire::process_connection(socket, tm, "roster".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(format!("test_{}", Ulid::new()))
        .user("roster")
        .password("roster");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Midnight-aligned timestamp a week from now, so scheduling is never
/// rejected as past-dated.
fn base() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    (now / DAY) * DAY + 7 * DAY
}

/// Data rows from a simple query result.
fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<tokio_postgres::SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn create_resource(client: &tokio_postgres::Client, name: &str, kind: &str) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, kind) VALUES ('{rid}', '{name}', '{kind}')"
        ))
        .await
        .unwrap();
    rid
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn connect_and_query() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let rid = create_resource(&client, "Projector", "equipment").await;

    let rows = data_rows(client.simple_query("SELECT * FROM resources").await.unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(rid.to_string().as_str()));
    assert_eq!(rows[0].get(1), Some("Projector"));
    assert_eq!(rows[0].get(2), Some("equipment"));
    assert_eq!(rows[0].get(3), Some("0"));
}

#[tokio::test]
async fn schedule_event_with_resources() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let room = create_resource(&client, "Room A", "room").await;
    let van = create_resource(&client, "Van", "vehicle").await;

    let eid = Ulid::new();
    let (s, e) = (base() + 9 * HOUR, base() + 11 * HOUR);
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, title, start, "end", description, resources)
               VALUES ('{eid}', 'Kickoff', {s}, {e}, 'launch meeting', '{room},{van}')"#
        ))
        .await
        .unwrap();

    let rows = data_rows(client.simple_query("SELECT * FROM allocations").await.unwrap());
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.get(1), Some(eid.to_string().as_str()));
        assert_eq!(row.get(3), Some(s.to_string().as_str()));
        assert_eq!(row.get(4), Some(e.to_string().as_str()));
    }

    let rows = data_rows(client.simple_query("SELECT * FROM events").await.unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(1), Some("Kickoff"));
    assert_eq!(rows[0].get(4), Some("launch meeting"));
}

#[tokio::test]
async fn conflicting_event_rejected_atomically() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let room = create_resource(&client, "Room A", "room").await;
    let van = create_resource(&client, "Van", "vehicle").await;

    let first = Ulid::new();
    let (s, e) = (base() + 9 * HOUR, base() + 11 * HOUR);
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, title, start, "end", description, resources)
               VALUES ('{first}', 'Standup', {s}, {e}, NULL, '{room}')"#
        ))
        .await
        .unwrap();

    // Second event wants the van (free) and the room (busy): nothing commits
    let second = Ulid::new();
    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, title, start, "end", description, resources)
               VALUES ('{second}', 'Offsite', {s}, {e}, NULL, '{van},{room}')"#
        ))
        .await
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("is busy with 'Standup'"), "got: {msg}");

    let rows = data_rows(client.simple_query("SELECT * FROM events").await.unwrap());
    assert_eq!(rows.len(), 1, "failed event must not be created");
    let rows = data_rows(client.simple_query("SELECT * FROM allocations").await.unwrap());
    assert_eq!(rows.len(), 1, "van must stay free");
}

#[tokio::test]
async fn incremental_allocation_reports_outcomes() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let room = create_resource(&client, "Room A", "room").await;
    let van = create_resource(&client, "Van", "vehicle").await;
    let camera = create_resource(&client, "Camera", "equipment").await;

    let (s, e) = (base() + 9 * HOUR, base() + 11 * HOUR);
    let blocker = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, title, start, "end", description, resources)
               VALUES ('{blocker}', 'Standup', {s}, {e}, NULL, '{van}')"#
        ))
        .await
        .unwrap();

    let eid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, title, start, "end", description, resources)
               VALUES ('{eid}', 'Shoot', {s}, {e}, NULL, '{room}')"#
        ))
        .await
        .unwrap();

    // room already held, van busy elsewhere, camera free
    let rows = data_rows(
        client
            .simple_query(&format!(
                "INSERT INTO allocations (event_id, resource_id) VALUES \
                 ('{eid}', '{room}'), ('{eid}', '{van}'), ('{eid}', '{camera}')"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 3);

    let status_of = |rid: Ulid| {
        rows.iter()
            .find(|r| r.get(0) == Some(rid.to_string().as_str()))
            .and_then(|r| r.get(1))
            .unwrap()
            .to_string()
    };
    assert_eq!(status_of(camera), "added");
    assert_eq!(status_of(van), "conflict");
    assert_eq!(status_of(room), "duplicate");

    let conflict_row = rows
        .iter()
        .find(|r| r.get(1) == Some("conflict"))
        .unwrap();
    assert!(conflict_row.get(2).unwrap().contains("busy with 'Standup'"));
}

#[tokio::test]
async fn usage_report_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let room = create_resource(&client, "Room A", "room").await;
    let _idle = create_resource(&client, "Van", "vehicle").await;

    let eid = Ulid::new();
    let (s, e) = (base() + 9 * HOUR, base() + 10 * HOUR + 30 * 60_000);
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, title, start, "end", description, resources)
               VALUES ('{eid}', 'Workshop', {s}, {e}, NULL, '{room}')"#
        ))
        .await
        .unwrap();

    let (day_s, day_e) = (base(), base());
    let rows = data_rows(
        client
            .simple_query(&format!(
                r#"SELECT * FROM usage WHERE start >= {day_s} AND "end" <= {day_e}"#
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 2, "every resource appears in the report");

    let room_row = rows
        .iter()
        .find(|r| r.get(0) == Some(room.to_string().as_str()))
        .unwrap();
    assert_eq!(room_row.get(3), Some("1.5"));
    assert_eq!(room_row.get(4), Some("1"));

    let idle_row = rows.iter().find(|r| r.get(1) == Some("Van")).unwrap();
    assert_eq!(idle_row.get(3), Some("0"));
    assert_eq!(idle_row.get(4), Some("0"));
}

#[tokio::test]
async fn conflict_preview_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let room = create_resource(&client, "Room A", "room").await;

    let eid = Ulid::new();
    let (s, e) = (base() + 9 * HOUR, base() + 11 * HOUR);
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, title, start, "end", description, resources)
               VALUES ('{eid}', 'Standup', {s}, {e}, NULL, '{room}')"#
        ))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!(
                r#"SELECT * FROM conflicts WHERE resource_id = '{room}' AND start >= {} AND "end" <= {}"#,
                s + HOUR,
                e + HOUR,
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(1), Some("Room A"));
    assert_eq!(rows[0].get(3), Some("Standup"));

    // Excluding the event itself clears the preview
    let rows = data_rows(
        client
            .simple_query(&format!(
                r#"SELECT * FROM conflicts WHERE resource_id = '{room}' AND start >= {} AND "end" <= {} AND exclude_event = '{eid}'"#,
                s + HOUR,
                e + HOUR,
            ))
            .await
            .unwrap(),
    );
    assert!(rows.is_empty());
}

#[tokio::test]
async fn edit_and_delete_event_flow() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let room = create_resource(&client, "Room A", "room").await;

    let eid = Ulid::new();
    let (s, e) = (base() + 9 * HOUR, base() + 11 * HOUR);
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, title, start, "end", description, resources)
               VALUES ('{eid}', 'Standup', {s}, {e}, NULL, '{room}')"#
        ))
        .await
        .unwrap();

    // Resource is allocated, so deleting it is refused
    let err = client
        .batch_execute(&format!("DELETE FROM resources WHERE id = '{room}'"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("still allocated"), "got: {err}");

    // Move the event later in the day; the allocation follows
    client
        .batch_execute(&format!(
            r#"UPDATE events SET title = 'Retro', start = {}, "end" = {} WHERE id = '{eid}'"#,
            s + 4 * HOUR,
            e + 4 * HOUR,
        ))
        .await
        .unwrap();

    let rows = data_rows(client.simple_query("SELECT * FROM allocations").await.unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(3), Some((s + 4 * HOUR).to_string().as_str()));

    // Deleting the event cascades and frees the resource
    client
        .batch_execute(&format!("DELETE FROM events WHERE id = '{eid}'"))
        .await
        .unwrap();
    let rows = data_rows(client.simple_query("SELECT * FROM allocations").await.unwrap());
    assert!(rows.is_empty());

    client
        .batch_execute(&format!("DELETE FROM resources WHERE id = '{room}'"))
        .await
        .unwrap();
}

#[tokio::test]
async fn tenants_are_isolated_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client_a = connect(addr).await;
    let client_b = connect(addr).await;

    create_resource(&client_a, "Room A", "room").await;

    let rows = data_rows(client_b.simple_query("SELECT * FROM resources").await.unwrap());
    assert!(rows.is_empty(), "tenant B must not see tenant A's resources");
}

#[tokio::test]
async fn malformed_sql_is_rejected() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let err = client
        .batch_execute("FROBNICATE THE CALENDAR")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("parse error"), "got: {err}");

    let err = client
        .batch_execute("SELECT * FROM unicorns")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown table"), "got: {err}");
}

#[tokio::test]
async fn past_dated_event_rejected_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let room = create_resource(&client, "Room A", "room").await;

    let eid = Ulid::new();
    let s = base() - 30 * DAY;
    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, title, start, "end", description, resources)
               VALUES ('{eid}', 'Retro', {s}, {}, NULL, '{room}')"#,
            s + HOUR,
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("past date"), "got: {err}");
}
