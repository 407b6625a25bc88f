//! Integration tests for connection state, query serialization, and
//! cancellation.

mod support;

use std::sync::Arc;
use std::time::Duration;

use arrow::array::Int32Array;
use serde_json::json;
use skiff::{BridgeError, ConnectionState, Database, DatabaseOptions};

use support::{int32_batch, QueryScript};

async fn open_db(scripts: Vec<QueryScript>) -> Database {
    let (transport, _stats) = support::spawn_host(scripts);
    let db = Database::new(transport);
    db.open(DatabaseOptions::in_memory()).await.unwrap();
    db
}

fn int_values(batches: &[arrow::record_batch::RecordBatch]) -> Vec<i32> {
    let mut values = Vec::new();
    for batch in batches {
        let col = skiff::decode::column_as::<Int32Array>(batch, 0).unwrap();
        for i in 0..col.len() {
            values.push(col.value(i));
        }
    }
    values
}

#[tokio::test]
async fn test_close_twice_is_noop() {
    let db = open_db(vec![]).await;
    let conn = db.connect().await.unwrap();

    conn.close().await.unwrap();
    assert!(conn.is_closed());
    conn.close().await.unwrap();
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_query_on_closed_connection_rejected() {
    let db = open_db(vec![]).await;
    let conn = db.connect().await.unwrap();
    conn.close().await.unwrap();

    let err = conn.query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, BridgeError::State(_)));
}

#[tokio::test]
async fn test_row_order_preserved_across_batches() {
    let db = open_db(vec![QueryScript::Batches(vec![
        int32_batch("n", vec![1, 2]),
        int32_batch("n", vec![3, 4]),
        int32_batch("n", vec![5]),
    ])])
    .await;
    let conn = db.connect().await.unwrap();

    let mut result = conn.query("SELECT n FROM t ORDER BY n").await.unwrap();
    let batches = result.collect().await.unwrap();
    assert_eq!(batches.len(), 3);
    assert_eq!(int_values(&batches), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_collect_twice_uses_cache() {
    let db = open_db(vec![QueryScript::Batches(vec![int32_batch(
        "n",
        vec![7, 8],
    )])])
    .await;
    let conn = db.connect().await.unwrap();

    let mut result = conn.query("SELECT n FROM t").await.unwrap();
    let first = result.collect().await.unwrap();
    assert!(result.is_finished());
    // Second collect must not re-fetch: the host has no second script, so a
    // re-execution would fail.
    let second = result.collect().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(result.num_rows(), 2);
}

#[tokio::test]
async fn test_lazy_and_eager_access_agree() {
    let db = open_db(vec![QueryScript::Batches(vec![
        int32_batch("n", vec![1]),
        int32_batch("n", vec![2]),
    ])])
    .await;
    let conn = db.connect().await.unwrap();

    let mut result = conn.query("SELECT n FROM t").await.unwrap();
    let head = result.next_batch().await.unwrap().unwrap();
    assert_eq!(int_values(&[head]), vec![1]);

    // collect picks up the already-delivered batch plus the rest.
    let all = result.collect().await.unwrap();
    assert_eq!(int_values(&all), vec![1, 2]);
}

#[tokio::test]
async fn test_bound_params_reach_host() {
    let scripts = vec![QueryScript::Batches(vec![int32_batch("n", vec![42])])];
    let (transport, stats) = support::spawn_host(scripts);
    let db = Database::new(transport);
    db.open(DatabaseOptions::in_memory()).await.unwrap();
    let conn = db.connect().await.unwrap();

    let mut result = conn
        .query_with_params("SELECT ? + ?", vec![json!(40), json!("two")])
        .await
        .unwrap();
    result.collect().await.unwrap();

    let queries = stats.received_queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].0, "SELECT ? + ?");
    assert_eq!(queries[0].1, Some(vec![json!(40), json!("two")]));
}

#[tokio::test]
async fn test_plain_query_sends_no_params() {
    let (transport, stats) = support::spawn_host(vec![]);
    let db = Database::new(transport);
    db.open(DatabaseOptions::in_memory()).await.unwrap();
    let conn = db.connect().await.unwrap();

    conn.query("SELECT 1").await.unwrap().collect().await.unwrap();

    let queries = stats.received_queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].1, None);
}

#[tokio::test]
async fn test_queries_serialize_in_submission_order() {
    let db = open_db(vec![
        QueryScript::Batches(vec![int32_batch("n", vec![10])]),
        QueryScript::Batches(vec![int32_batch("n", vec![20])]),
    ])
    .await;
    let conn = Arc::new(db.connect().await.unwrap());

    let mut first = conn.query("first").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Querying);

    let conn2 = Arc::clone(&conn);
    let second = tokio::spawn(async move {
        let mut result = conn2.query("second").await.unwrap();
        result.collect().await.unwrap()
    });

    // The second query queues behind the first one's stream.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());

    let batches = first.collect().await.unwrap();
    assert_eq!(int_values(&batches), vec![10]);

    let batches = second.await.unwrap();
    assert_eq!(int_values(&batches), vec![20]);
    assert_eq!(conn.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_engine_error_leaves_connection_usable() {
    let db = open_db(vec![QueryScript::Fail {
        code: "SYNTAX_ERROR".to_string(),
        message: "unexpected token".to_string(),
    }])
    .await;
    let conn = db.connect().await.unwrap();

    let mut result = conn.query("SELEC 1").await.unwrap();
    let err = result.collect().await.unwrap_err();
    match err {
        BridgeError::Engine { code, message } => {
            assert_eq!(code, "SYNTAX_ERROR");
            assert_eq!(message, "unexpected token");
        }
        other => panic!("unexpected error: {}", other),
    }

    // Back to open and able to run the next query.
    assert_eq!(conn.state(), ConnectionState::Open);
    let mut result = conn.query("SELECT 1").await.unwrap();
    let batches = result.collect().await.unwrap();
    assert_eq!(int_values(&batches), vec![1]);
}

#[tokio::test]
async fn test_failed_result_keeps_failing() {
    let db = open_db(vec![QueryScript::Fail {
        code: "IO_ERROR".to_string(),
        message: "disk gone".to_string(),
    }])
    .await;
    let conn = db.connect().await.unwrap();

    let mut result = conn.query("SELECT * FROM t").await.unwrap();
    let first = result.collect().await.unwrap_err();
    assert!(matches!(first, BridgeError::Engine { .. }));

    // Later polls resurface the terminal error instead of passing the
    // partial cache off as a completed stream.
    let again = result.collect().await.unwrap_err();
    assert!(matches!(again, BridgeError::Engine { .. }));
    let err = result.next_batch().await.unwrap_err();
    assert!(matches!(err, BridgeError::Engine { .. }));
}

#[tokio::test]
async fn test_cancel_rejects_result_and_reopens_connection() {
    let db = open_db(vec![QueryScript::Hang]).await;
    let conn = db.connect().await.unwrap();

    let mut result = conn.query("SELECT hang()").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Querying);

    conn.cancel_pending().await.unwrap();
    let err = result.next_batch().await.unwrap_err();
    assert!(err.is_cancelled());

    // Immediately able to accept a new query.
    assert_eq!(conn.state(), ConnectionState::Open);
    let mut result = conn.query("SELECT 1").await.unwrap();
    let batches = result.collect().await.unwrap();
    assert_eq!(int_values(&batches), vec![1]);
}

#[tokio::test]
async fn test_cancel_with_nothing_in_flight_is_noop() {
    let db = open_db(vec![]).await;
    let conn = db.connect().await.unwrap();
    conn.cancel_pending().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_close_resolves_pending_query() {
    let db = open_db(vec![QueryScript::Hang]).await;
    let conn = db.connect().await.unwrap();

    let mut result = conn.query("SELECT hang()").await.unwrap();
    conn.close().await.unwrap();

    let err = result.next_batch().await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(conn.is_closed());
}
