//! Integration tests for endpoint failover over HTTP
//!
//! Runs the data source against wiremock servers standing in for a primary
//! and a secondary HA endpoint.

use litesql_ha::domain::entities::{EndpointHealth, TransactionState};
use litesql_ha::{Config, DataSource, Error, Params};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::assert_ok;
use tracing_test::traced_test;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn litesql_url(server: &MockServer) -> String {
    format!("{}/app.db", server.uri().replace("http://", "litesql://"))
}

fn address(server: &MockServer) -> String {
    server.address().to_string()
}

fn rows(source: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "columns": ["source"],
        "rows": [[{ "type": "text", "value": source }]],
        "txseq": 3
    }))
}

fn first_text(result: &litesql_ha::QueryResult) -> Option<String> {
    result
        .rows
        .first()
        .and_then(|row| row[0].as_str())
        .map(str::to_string)
}

async fn data_source(config: Config) -> DataSource {
    DataSource::builder(config).build().await.unwrap()
}

/// Reads move to the secondary when the primary fails
#[tokio::test]
#[traced_test]
async fn test_read_fails_over_to_secondary() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(rows("secondary"))
        .mount(&secondary)
        .await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let ds = DataSource::builder(
        Config::new(litesql_url(&primary))
            .fallback_url(litesql_url(&secondary))
            .failover_cooldown(Duration::from_secs(60)),
    )
    .on_health_change(move |address, healthy| {
        sink.lock().unwrap().push((address.to_string(), healthy));
    })
    .build()
    .await
    .unwrap();
    let mut conn = ds.get_connection().unwrap();

    let result = conn.query("SELECT source FROM nodes", &Params::new()).await.unwrap();

    assert_eq!(first_text(&result).as_deref(), Some("secondary"));
    assert_eq!(conn.endpoint().unwrap().address, address(&secondary));
    assert_eq!(
        ds.supervisor().health(&address(&primary)),
        Some(EndpointHealth::Unhealthy)
    );
    assert!(logs_contain("is now unhealthy"));
    assert_eq!(*events.lock().unwrap(), vec![(address(&primary), false)]);

    ds.close().await;
}

/// A write that timed out may have reached the server and is not resent
#[tokio::test]
async fn test_write_not_retried_after_timeout() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "rows_affected": 1 }))
                .set_delay(Duration::from_millis(500)),
        )
        .expect(1)
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&secondary)
        .await;

    let ds = data_source(
        Config::new(litesql_url(&primary))
            .fallback_url(litesql_url(&secondary))
            .query_timeout(Duration::from_millis(100)),
    )
    .await;
    let mut conn = ds.get_connection().unwrap();

    let result = conn
        .execute("UPDATE accounts SET balance = 0", &Params::new())
        .await;

    assert!(matches!(result, Err(Error::Timeout)));
    ds.close().await;
}

/// A commit without an answer is reported as unknown and never resent
#[tokio::test]
async fn test_commit_timeout_is_unknown() {
    let primary = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .and(body_partial_json(serde_json::json!({ "sql": "COMMIT" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "txseq": 8 }))
                .set_delay(Duration::from_millis(500)),
        )
        .expect(1)
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "rows_affected": 1,
            "txseq": 7
        })))
        .mount(&primary)
        .await;

    let ds = data_source(
        Config::new(litesql_url(&primary)).query_timeout(Duration::from_millis(100)),
    )
    .await;
    let mut conn = ds.get_connection().unwrap();

    conn.begin_transaction().await.unwrap();
    conn.execute("INSERT INTO t VALUES (1)", &Params::new())
        .await
        .unwrap();

    assert!(matches!(conn.commit().await, Err(Error::CommitUnknown)));
    assert_eq!(conn.transaction_state(), TransactionState::Unknown);
    assert!(matches!(
        conn.execute("INSERT INTO t VALUES (2)", &Params::new()).await,
        Err(Error::TransactionUnresolved)
    ));

    conn.close().await;
    ds.close().await;
}

/// A 5xx on a write means the server saw it, so it is not resent elsewhere
#[tokio::test]
async fn test_write_not_resent_after_server_error() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .expect(1)
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "rows_affected": 1
        })))
        .expect(0)
        .mount(&secondary)
        .await;

    let ds = data_source(
        Config::new(litesql_url(&primary)).fallback_url(litesql_url(&secondary)),
    )
    .await;
    let mut conn = ds.get_connection().unwrap();

    let result = conn
        .execute("INSERT INTO orders VALUES (1)", &Params::new())
        .await;

    assert!(matches!(result, Err(Error::Interrupted(msg)) if msg.contains("500")));
    ds.close().await;
}

/// A commit answered with a 5xx may have been applied and is reported unknown
#[tokio::test]
async fn test_commit_server_error_is_unknown() {
    let primary = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .and(body_partial_json(serde_json::json!({ "sql": "COMMIT" })))
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "rows_affected": 1
        })))
        .mount(&primary)
        .await;

    let ds = data_source(Config::new(litesql_url(&primary))).await;
    let mut conn = ds.get_connection().unwrap();

    conn.begin_transaction().await.unwrap();
    conn.execute("INSERT INTO t VALUES (1)", &Params::new())
        .await
        .unwrap();

    assert!(matches!(conn.commit().await, Err(Error::CommitUnknown)));
    assert_eq!(conn.transaction_state(), TransactionState::Unknown);

    conn.close().await;
    ds.close().await;
}

/// Server-side rejections are returned as-is without touching health
#[tokio::test]
async fn test_rejected_statement_does_not_fail_over() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "error": "no such table: missing" })),
        )
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .respond_with(rows("secondary"))
        .expect(0)
        .mount(&secondary)
        .await;

    let ds = data_source(
        Config::new(litesql_url(&primary)).fallback_url(litesql_url(&secondary)),
    )
    .await;
    let mut conn = ds.get_connection().unwrap();

    let result = conn.query("SELECT * FROM missing", &Params::new()).await;

    assert!(matches!(result, Err(Error::Rejected(msg)) if msg.contains("no such table")));
    assert_eq!(
        ds.supervisor().health(&address(&primary)),
        Some(EndpointHealth::Healthy)
    );
    ds.close().await;
}

/// The probe loop brings a recovered primary back after its cool-down
#[tokio::test]
async fn test_probe_restores_primary() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(rows("primary"))
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(rows("secondary"))
        .mount(&secondary)
        .await;

    let ds = data_source(
        Config::new(litesql_url(&primary))
            .fallback_url(litesql_url(&secondary))
            .failover_cooldown(Duration::from_millis(100))
            .probe_interval(Duration::from_millis(20)),
    )
    .await;

    let mut first = ds.get_connection().unwrap();
    let result = first.query("SELECT source", &Params::new()).await.unwrap();
    assert_eq!(first_text(&result).as_deref(), Some("secondary"));

    let primary_address = address(&primary);
    tokio::time::timeout(Duration::from_secs(5), async {
        while ds.supervisor().health(&primary_address) != Some(EndpointHealth::Healthy) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("primary was never restored");

    let mut second = ds.get_connection().unwrap();
    let result = second.query("SELECT source", &Params::new()).await.unwrap();
    assert_eq!(first_text(&result).as_deref(), Some("primary"));

    ds.close().await;
}

/// Concurrent sessions all fail over while the primary is down
#[tokio::test]
async fn test_concurrent_sessions_fail_over() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/query"))
        .respond_with(rows("secondary"))
        .mount(&secondary)
        .await;

    let ds = data_source(
        Config::new(litesql_url(&primary))
            .fallback_url(litesql_url(&secondary))
            .failover_cooldown(Duration::from_secs(60)),
    )
    .await;

    let futures = (0..8).map(|_| {
        let mut conn = ds.get_connection().unwrap();
        async move { conn.query("SELECT source", &Params::new()).await }
    });
    let results = futures::future::join_all(futures).await;

    for result in results {
        let result = assert_ok!(result);
        assert_eq!(first_text(&result).as_deref(), Some("secondary"));
    }
    ds.close().await;
}

/// Every endpoint down surfaces NoHealthyEndpoint once attempts run out
#[tokio::test]
async fn test_all_endpoints_down() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    for server in [&primary, &secondary] {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(server)
            .await;
    }

    let ds = data_source(
        Config::new(litesql_url(&primary))
            .fallback_url(litesql_url(&secondary))
            .failover_cooldown(Duration::from_secs(60))
            .max_attempts(3),
    )
    .await;
    let mut conn = ds.get_connection().unwrap();

    let result = conn.query("SELECT 1", &Params::new()).await;

    assert!(matches!(result, Err(Error::NoHealthyEndpoint)));
    assert!(!conn.is_valid(Duration::from_millis(200)).await);
    ds.close().await;
}
