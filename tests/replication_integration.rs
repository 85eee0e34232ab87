//! Integration tests for the embedded replica read path
//!
//! Feeds change batches through an in-process change feed into replicas
//! opened by the data source, with wiremock standing in for the server.

use litesql_ha::adapters::outbound::{DashMapCursorStore, InMemoryChangeFeed, CURSOR_FILE};
use litesql_ha::infrastructure::BackoffConfig;
use litesql_ha::{
    ChangeBatch, Config, DataSource, FeedState, Params, QueryResult, RemoteReason, Route,
};
use rusqlite::Connection as SqliteConnection;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use tokio_test::assert_ok;
use tracing_test::traced_test;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(5);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Write a replica file with `users` rows at `sequence`.
fn write_replica(path: &Path, sequence: i64, users: i64, applied_at_ms: i64) {
    let conn = SqliteConnection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE ha_stats (received_seq INTEGER NOT NULL, updated_at INTEGER NOT NULL);",
    )
    .unwrap();
    for id in 0..users {
        conn.execute("INSERT INTO users (id, name) VALUES (?1, 'seed')", [id])
            .unwrap();
    }
    conn.execute(
        "INSERT INTO ha_stats (received_seq, updated_at) VALUES (?1, ?2)",
        [sequence, applied_at_ms],
    )
    .unwrap();
}

fn replica_image(sequence: i64, users: i64) -> Vec<u8> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("image.db");
    write_replica(&path, sequence, users, now_ms());
    std::fs::read(&path).unwrap()
}

async fn server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "columns": ["count"],
            "rows": [[{ "type": "integer", "value": -1 }]]
        })))
        .mount(&server)
        .await;
    server
}

fn config(server: &MockServer, dir: &TempDir) -> Config {
    let url = format!("{}/app.db", server.uri().replace("http://", "litesql://"));
    Config::new(url).replicas(dir.path(), "http://feed.invalid", "client-1")
}

async fn build(config: Config, feed: &InMemoryChangeFeed) -> DataSource {
    let ds = DataSource::builder(config)
        .change_feed(Arc::new(feed.clone()))
        .cursor_store(Arc::new(DashMapCursorStore::new()))
        .feed_backoff(BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            jitter: Duration::ZERO,
        })
        .build()
        .await
        .unwrap();
    wait_for_state(&ds, FeedState::Streaming).await;
    ds
}

async fn wait_for_state(ds: &DataSource, state: FeedState) {
    tokio::time::timeout(WAIT, async {
        while ds.replication_state("app.db") != Some(state) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("replica never reached {}", state));
}

async fn wait_for_sequence(ds: &DataSource, sequence: u64) {
    tokio::time::timeout(WAIT, async {
        while ds.replica_snapshot("app.db").map(|s| s.sequence) != Some(sequence) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("replica never reached sequence {}", sequence));
}

fn count(result: &QueryResult) -> i64 {
    result.rows[0][0].as_i64().unwrap()
}

fn insert_users(base: u64, end: u64, ids: &[i64]) -> ChangeBatch {
    let statements = ids
        .iter()
        .map(|id| format!("INSERT INTO users (id, name) VALUES ({}, 'fed')", id))
        .collect();
    ChangeBatch::new("app.db", base, end, statements)
}

/// Reads come from the replica and follow applied batches; redelivery is a no-op
#[tokio::test]
async fn test_reads_follow_the_feed() {
    let server = server().await;
    let dir = TempDir::new().unwrap();
    write_replica(&dir.path().join("app.db"), 10, 1, now_ms());

    let feed = InMemoryChangeFeed::new();
    let ds = build(config(&server, &dir), &feed).await;
    let mut conn = ds.get_connection().unwrap();

    let result = conn.query("SELECT COUNT(*) FROM users", &Params::new()).await.unwrap();
    assert_eq!(count(&result), 1);
    assert_eq!(conn.last_route(), Some(Route::Replica));

    feed.publish(insert_users(10, 15, &[100, 101]));
    wait_for_sequence(&ds, 15).await;
    let result = conn.query("SELECT COUNT(*) FROM users", &Params::new()).await.unwrap();
    assert_eq!(count(&result), 3);

    feed.publish(insert_users(10, 15, &[100, 101]));
    feed.publish(insert_users(15, 16, &[102]));
    wait_for_sequence(&ds, 16).await;
    let result = conn.query("SELECT COUNT(*) FROM users", &Params::new()).await.unwrap();
    assert_eq!(count(&result), 4);

    tokio::time::timeout(WAIT, async {
        while feed.acked("app.db", "client-1") != Some(16) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    conn.close().await;
    ds.close().await;
}

/// A gap in the feed triggers a full download from the server
#[tokio::test]
#[traced_test]
async fn test_gap_resyncs_from_server() {
    let server = server().await;
    Mock::given(method("GET"))
        .and(path("/v1/replicas/app.db"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(replica_image(20, 5)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    write_replica(&dir.path().join("app.db"), 10, 1, now_ms());

    let feed = InMemoryChangeFeed::new();
    let ds = build(config(&server, &dir), &feed).await;

    feed.publish(insert_users(12, 14, &[200]));
    wait_for_sequence(&ds, 20).await;
    wait_for_state(&ds, FeedState::Streaming).await;

    let mut conn = ds.get_connection().unwrap();
    let result = conn.query("SELECT COUNT(*) FROM users", &Params::new()).await.unwrap();
    assert_eq!(count(&result), 5);
    assert_eq!(conn.last_route(), Some(Route::Replica));
    assert!(logs_contain("resyncing"));

    ds.close().await;
}

/// Queries running during applies never see half of a batch
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_see_whole_batches() {
    let server = server().await;
    let dir = TempDir::new().unwrap();
    write_replica(&dir.path().join("app.db"), 0, 0, now_ms());

    let feed = InMemoryChangeFeed::new();
    let ds = build(config(&server, &dir), &feed).await;

    let publisher = feed.clone();
    let writer = tokio::spawn(async move {
        for i in 0..50u64 {
            let first = (i * 2) as i64;
            publisher.publish(insert_users(i, i + 1, &[first, first + 1]));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });

    let readers = (0..4).map(|_| {
        let mut conn = ds.get_connection().unwrap();
        async move {
            let mut counts = Vec::new();
            for _ in 0..50 {
                let result = conn
                    .query("SELECT COUNT(*) FROM users", &Params::new())
                    .await?;
                counts.push(count(&result));
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Ok::<_, litesql_ha::Error>(counts)
        }
    });
    let results = futures::future::join_all(readers).await;

    for result in results {
        let counts = assert_ok!(result);
        assert!(counts.iter().all(|c| c % 2 == 0), "partial batch seen: {:?}", counts);
        assert!(counts.windows(2).all(|w| w[0] <= w[1]), "went backwards: {:?}", counts);
    }

    writer.await.unwrap();
    wait_for_sequence(&ds, 50).await;
    ds.close().await;
}

/// With a staleness bound, an idle replica stops serving reads
#[tokio::test]
async fn test_stale_replica_routes_to_server() {
    let server = server().await;
    let dir = TempDir::new().unwrap();
    write_replica(&dir.path().join("app.db"), 10, 1, now_ms());

    let feed = InMemoryChangeFeed::new();
    let config = config(&server, &dir).max_staleness(Duration::from_secs(1));
    let ds = build(config, &feed).await;
    let mut conn = ds.get_connection().unwrap();

    let result = conn.query("SELECT COUNT(*) FROM users", &Params::new()).await.unwrap();
    assert_eq!(count(&result), 1);
    assert_eq!(conn.last_route(), Some(Route::Replica));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let result = conn.query("SELECT COUNT(*) FROM users", &Params::new()).await.unwrap();
    assert_eq!(count(&result), -1);
    assert!(matches!(conn.last_route(), Some(Route::Remote(_))));

    // A fresh apply makes the replica eligible again
    feed.publish(insert_users(10, 11, &[7]));
    wait_for_sequence(&ds, 11).await;
    let result = conn.query("SELECT COUNT(*) FROM users", &Params::new()).await.unwrap();
    assert_eq!(count(&result), 2);

    ds.close().await;
}

/// The default cursor store survives a restart and is not mistaken for a replica
#[tokio::test]
async fn test_cursor_survives_restart() {
    let server = server().await;
    let dir = TempDir::new().unwrap();
    write_replica(&dir.path().join("app.db"), 10, 0, now_ms());
    let feed = InMemoryChangeFeed::new();

    let build_default = |config: Config| {
        let feed = feed.clone();
        async move {
            let ds = DataSource::builder(config)
                .change_feed(Arc::new(feed))
                .build()
                .await
                .unwrap();
            wait_for_state(&ds, FeedState::Streaming).await;
            ds
        }
    };

    let ds = build_default(config(&server, &dir)).await;
    feed.publish(insert_users(10, 12, &[1]));
    wait_for_sequence(&ds, 12).await;
    ds.close().await;
    drop(ds);

    assert!(dir.path().join(CURSOR_FILE).exists());

    let ds = build_default(config(&server, &dir)).await;
    assert_eq!(ds.replicas(), vec!["app.db"]);
    assert_eq!(ds.replica_snapshot("app.db").unwrap().sequence, 12);

    feed.publish(insert_users(12, 13, &[2]));
    wait_for_sequence(&ds, 13).await;

    let mut conn = ds.get_connection().unwrap();
    let result = conn.query("SELECT COUNT(*) FROM users", &Params::new()).await.unwrap();
    assert_eq!(count(&result), 2);
    ds.close().await;
}

/// Until the feed server binds the consumer, reads go to the server
#[tokio::test]
async fn test_unacknowledged_subscription_is_not_streaming() {
    let server = server().await;
    let feed_server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/streams/ha/ha.app_db/consumers/client-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "acked": 10 }))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&feed_server)
        .await;

    let dir = TempDir::new().unwrap();
    write_replica(&dir.path().join("app.db"), 10, 1, now_ms());

    let url = format!("{}/app.db", server.uri().replace("http://", "litesql://"));
    let config = Config::new(url).replicas(dir.path(), feed_server.uri(), "client-1");
    let ds = DataSource::builder(config)
        .cursor_store(Arc::new(DashMapCursorStore::new()))
        .build()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(ds.replication_state("app.db"), Some(FeedState::Subscribing));

    let mut conn = ds.get_connection().unwrap();
    let result = conn.query("SELECT COUNT(*) FROM users", &Params::new()).await.unwrap();
    assert_eq!(count(&result), -1);
    assert_eq!(
        conn.last_route(),
        Some(Route::Remote(RemoteReason::FeedNotStreaming(FeedState::Subscribing)))
    );

    ds.close().await;
}
