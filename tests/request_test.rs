//! Integration tests for prepared requests: cursor handling, tracking, and
//! replay after a lost connection.

use std::sync::Arc;
use steady_db::{
    Admin, ConnectTarget, ErrorKind, PreparedRequest, Session, SessionOptions, SimpleRequest,
    SqlType, SqlValue,
};
use tempfile::NamedTempFile;

fn sqlite_url() -> String {
    let db_path = NamedTempFile::new()
        .unwrap()
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    format!("sqlite://{db_path}")
}

async fn setup() -> (Admin, Arc<Session>) {
    let admin = Admin::with_options(
        ConnectTarget::new(sqlite_url()).unwrap(),
        SessionOptions {
            grace_delay_ms: Some(10),
            ..Default::default()
        },
    )
    .unwrap();
    let session = admin.open_session().await.unwrap();
    session
        .execute(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)",
            &[],
        )
        .await
        .unwrap();
    (admin, session)
}

#[tokio::test]
async fn test_prepared_update_and_cursor() {
    let (_admin, session) = setup().await;

    let insert = PreparedRequest::new(&session, "INSERT INTO items (id, label) VALUES (?, ?)")
        .await
        .unwrap();
    for (id, label) in [(1, "one"), (2, "two"), (3, "three")] {
        let affected = insert
            .execute_update(&[SqlValue::BigInt(id), SqlValue::Text(label.into())])
            .await
            .unwrap();
        assert_eq!(affected, 1);
    }

    let select = PreparedRequest::new(&session, "SELECT id, label FROM items ORDER BY id")
        .await
        .unwrap();
    select
        .execute_query(&[], &[SqlType::BigInt, SqlType::Text])
        .await
        .unwrap();
    assert_eq!(select.row_count(), Some(3));

    let first = select.next_row().unwrap();
    assert_eq!(first, vec![SqlValue::BigInt(1), SqlValue::Text("one".into())]);
    assert!(select.next_row().is_some());
    assert!(select.next_row().is_some());
    assert!(select.next_row().is_none());

    // Lightweight close drops the cursor but leaves the statement usable.
    select.close();
    assert!(select.is_ready());
    assert_eq!(select.row_count(), None);
    select
        .execute_query(&[], &[SqlType::BigInt, SqlType::Text])
        .await
        .unwrap();
    assert_eq!(select.row_count(), Some(3));
}

#[tokio::test]
async fn test_tracked_statement_survives_reconnect() {
    let (_admin, session) = setup().await;
    session
        .execute(
            "INSERT INTO items (id, label) VALUES (?, ?)",
            &[SqlValue::BigInt(1), SqlValue::Text("kept".into())],
        )
        .await
        .unwrap();

    let select = PreparedRequest::new(&session, "SELECT label FROM items WHERE id = ?")
        .await
        .unwrap();
    select.track();
    assert_eq!(session.tracked_count(), 1);

    let epoch_before = select.compiled_epoch();
    session.mark_disconnected().await;

    // The next use renews the session and replays the handle.
    let row = select
        .single_row(&[SqlValue::BigInt(1)], &[SqlType::Text])
        .await
        .unwrap();
    assert_eq!(row, vec![SqlValue::Text("kept".into())]);
    assert!(select.is_ready());
    assert!(select.compiled_epoch() > epoch_before);
}

#[tokio::test]
async fn test_untracked_statement_is_invalidated_by_reconnect() {
    let (_admin, session) = setup().await;

    let select = PreparedRequest::new(&session, "SELECT label FROM items WHERE id = ?")
        .await
        .unwrap();
    session.mark_disconnected().await;

    let err = select
        .execute_query(&[SqlValue::BigInt(1)], &[SqlType::Text])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Sql);
    assert!(err.to_string().contains("invalidated by reconnection"));

    // A fresh handle on the renewed session works.
    let fresh = PreparedRequest::new(&session, "SELECT label FROM items WHERE id = ?")
        .await
        .unwrap();
    fresh
        .execute_query(&[SqlValue::BigInt(1)], &[SqlType::Text])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_replay_is_best_effort_across_tracked_statements() {
    let (_admin, session) = setup().await;
    session
        .execute("CREATE TABLE doomed (id INTEGER)", &[])
        .await
        .unwrap();

    let good = PreparedRequest::new(&session, "SELECT COUNT(*) FROM items")
        .await
        .unwrap();
    good.track();
    let bad = PreparedRequest::new(&session, "SELECT id FROM doomed")
        .await
        .unwrap();
    bad.track();

    session.execute("DROP TABLE doomed", &[]).await.unwrap();
    session.mark_disconnected().await;

    // Renew reopens and replays both; the dropped table makes one replay
    // fail, and that failure is reported.
    let err = session.validate().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Sql);
    assert!(!session.is_disconnected().await);

    // The surviving handle was replayed and keeps working.
    let row = good.single_row(&[], &[SqlType::BigInt]).await.unwrap();
    assert_eq!(row, vec![SqlValue::BigInt(0)]);

    // The failed one is left unusable.
    let err = bad.execute_query(&[], &[SqlType::BigInt]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Sql);
}

#[tokio::test]
async fn test_real_close_stops_replay() {
    let (_admin, session) = setup().await;

    let select = PreparedRequest::new(&session, "SELECT label FROM items WHERE id = ?")
        .await
        .unwrap();
    select.track();
    assert_eq!(session.tracked_count(), 1);

    select.real_close();
    assert_eq!(session.tracked_count(), 0);
    assert!(!select.is_ready());

    let err = select
        .execute_query(&[SqlValue::BigInt(1)], &[SqlType::Text])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Sql);
}

#[tokio::test]
async fn test_session_close_releases_tracked_statements() {
    let (_admin, session) = setup().await;

    let select = PreparedRequest::new(&session, "SELECT label FROM items WHERE id = ?")
        .await
        .unwrap();
    select.track();

    session.force_disconnect().await.unwrap();
    assert_eq!(session.tracked_count(), 0);
    assert!(!select.is_ready());
}

#[tokio::test]
async fn test_single_row_reports_no_data() {
    let (_admin, session) = setup().await;

    let select = PreparedRequest::new(&session, "SELECT label FROM items WHERE id = ?")
        .await
        .unwrap();
    let err = select
        .single_row(&[SqlValue::BigInt(99)], &[SqlType::Text])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoData);

    let simple = SimpleRequest::new(Arc::clone(&session));
    let err = simple
        .single_row(
            "SELECT label FROM items WHERE id = ?",
            &[SqlValue::BigInt(99)],
            &[SqlType::Text],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoData);
}

#[tokio::test]
async fn test_simple_request_json_rows() {
    let (_admin, session) = setup().await;
    let simple = SimpleRequest::new(Arc::clone(&session));

    simple
        .execute(
            "INSERT INTO items (id, label) VALUES (?, ?)",
            &[SqlValue::BigInt(1), SqlValue::Text("one".into())],
        )
        .await
        .unwrap();

    let rows = simple
        .query_json("SELECT id, label FROM items", &[])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], serde_json::json!(1));
    assert_eq!(rows[0]["label"], serde_json::json!("one"));
}

#[tokio::test]
async fn test_statement_error_carries_statement_text() {
    let (_admin, session) = setup().await;

    let err = session
        .execute("INSERT INTO missing_table (id) VALUES (1)", &[])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Sql);
    assert!(err.to_string().contains("missing_table"));
}
