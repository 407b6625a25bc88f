//! Integration tests for database open/connect lifecycle.

mod support;

use skiff::{AccessMode, BridgeError, Database, DatabaseOptions};

use support::QueryScript;

#[tokio::test]
async fn test_open_connect_select_one() {
    let (transport, _stats) = support::spawn_host(vec![]);
    let db = Database::new(transport);
    db.open(DatabaseOptions::in_memory()).await.unwrap();

    let conn = db.connect().await.unwrap();
    let mut result = conn.query("SELECT 1").await.unwrap();
    let batches = result.collect().await.unwrap();

    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].num_columns(), 1);
    assert_eq!(batches[0].num_rows(), 1);
    let col = skiff::decode::column_as::<arrow::array::Int32Array>(&batches[0], 0).unwrap();
    assert_eq!(col.value(0), 1);

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_open_twice_is_state_error() {
    let (transport, _stats) = support::spawn_host(vec![]);
    let db = Database::new(transport);
    db.open(DatabaseOptions::in_memory()).await.unwrap();

    let err = db.open(DatabaseOptions::in_memory()).await.unwrap_err();
    assert!(matches!(err, BridgeError::State(_)));
    // Still usable after the failed re-open.
    assert!(db.is_open());
    db.connect().await.unwrap();
}

#[tokio::test]
async fn test_contradictory_options_fail_open() {
    let (transport, _stats) = support::spawn_host(vec![]);
    let db = Database::new(transport);

    let options = DatabaseOptions {
        access_mode: AccessMode::ReadOnly,
        ..DatabaseOptions::in_memory()
    };
    let err = db.open(options).await.unwrap_err();
    assert!(matches!(err, BridgeError::Config(_)));
    assert!(!db.is_open());

    // A valid open afterwards succeeds.
    db.open(DatabaseOptions::in_memory()).await.unwrap();
}

#[tokio::test]
async fn test_connect_before_open_is_state_error() {
    let (transport, _stats) = support::spawn_host(vec![]);
    let db = Database::new(transport);

    let err = db.connect().await.unwrap_err();
    assert!(matches!(err, BridgeError::State(_)));
}

#[tokio::test]
async fn test_connections_get_distinct_sessions() {
    let (transport, _stats) = support::spawn_host(vec![]);
    let db = Database::new(transport);
    db.open(DatabaseOptions::in_memory()).await.unwrap();

    let first = db.connect().await.unwrap();
    let second = db.connect().await.unwrap();
    assert_ne!(first.session(), second.session());
}

#[tokio::test]
async fn test_terminate_invalidates_everything() {
    let (transport, _stats) = support::spawn_host(vec![QueryScript::Hang]);
    let db = Database::new(transport);
    db.open(DatabaseOptions::in_memory()).await.unwrap();

    let conn = db.connect().await.unwrap();
    let mut pending = conn.query("SELECT hang()").await.unwrap();

    db.terminate();

    // The pending query resolves with a cancellation error, never hangs.
    let err = pending.next_batch().await.unwrap_err();
    assert!(err.is_cancelled());

    // New work on the invalidated connection fails.
    let err = conn.query("SELECT 1").await.unwrap_err();
    assert!(err.is_disconnected());

    // Close still succeeds: the session died with the host link.
    conn.close().await.unwrap();
}
