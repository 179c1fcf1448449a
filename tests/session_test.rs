//! Integration tests for session lifecycle, reconnection, and transaction
//! control, using throwaway SQLite databases.

use std::sync::Arc;
use steady_db::{Admin, ConnectTarget, ErrorKind, SessionOptions, SqlType, SqlValue};
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

fn test_options() -> SessionOptions {
    SessionOptions {
        grace_delay_ms: Some(10),
        ..Default::default()
    }
}

fn admin_for(url: &str) -> Admin {
    Admin::with_options(ConnectTarget::new(url).unwrap(), test_options()).unwrap()
}

#[tokio::test]
async fn test_open_assigns_id_and_registers() {
    let url = sqlite_url();
    let admin = admin_for(&url);

    let session = admin.open_session().await.unwrap();
    assert!(session.id().is_some());
    assert_eq!(admin.registry().len(), 1);
    assert!(!session.is_disconnected().await);

    session.force_disconnect().await.unwrap();
    assert!(session.is_disconnected().await);
    assert_eq!(admin.registry().len(), 0);
}

#[tokio::test]
async fn test_renew_keeps_session_id() {
    let url = sqlite_url();
    let admin = admin_for(&url);

    let session = admin.open_session().await.unwrap();
    let id = session.id().unwrap();
    session.renew().await.unwrap();
    assert_eq!(session.id(), Some(id));
    assert_eq!(admin.registry().len(), 1);
}

#[tokio::test]
async fn test_end_use_defers_disconnect_until_last_user() {
    let url = sqlite_url();
    let admin = admin_for(&url);
    let session = admin.new_session();

    session.use_connection().await.unwrap();
    session.use_connection().await.unwrap();
    assert_eq!(session.ref_count(), 2);

    session.end_use_connection();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!session.is_disconnected().await);

    session.end_use_connection();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(session.is_disconnected().await);
    assert_eq!(session.ref_count(), 0);
}

#[tokio::test]
async fn test_new_user_within_grace_keeps_connection() {
    let url = sqlite_url();
    let admin = admin_for(&url);
    let session = admin.new_session();

    session.use_connection().await.unwrap();
    session.end_use_connection();
    // Grab the session again before the grace delay elapses.
    session.use_connection().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!session.is_disconnected().await);
    session.end_use_connection();
}

#[tokio::test]
async fn test_validate_renews_after_mark_disconnected() {
    let url = sqlite_url();
    let admin = admin_for(&url);
    let session = admin.open_session().await.unwrap();

    session.mark_disconnected().await;
    assert!(session.is_disconnected().await);

    session.validate().await.unwrap();
    assert!(!session.is_disconnected().await);
}

#[tokio::test]
async fn test_execute_is_transparent_over_lost_connection() {
    let url = sqlite_url();
    let admin = admin_for(&url);
    let session = admin.open_session().await.unwrap();

    session
        .execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)", &[])
        .await
        .unwrap();

    session.mark_disconnected().await;
    let affected = session
        .execute(
            "INSERT INTO notes (id, body) VALUES (?, ?)",
            &[SqlValue::BigInt(1), SqlValue::Text("hello".into())],
        )
        .await
        .unwrap();
    assert_eq!(affected, 1);

    let rows = session
        .query_typed("SELECT body FROM notes", &[], &[SqlType::Text])
        .await
        .unwrap();
    assert_eq!(rows, vec![vec![SqlValue::Text("hello".into())]]);
}

#[tokio::test]
async fn test_commit_makes_writes_visible_to_other_sessions() {
    let url = sqlite_url();
    let admin = admin_for(&url);

    let setup = admin.open_session().await.unwrap();
    setup
        .execute("CREATE TABLE events (id INTEGER PRIMARY KEY)", &[])
        .await
        .unwrap();

    let writer = admin.new_session_with(SessionOptions {
        auto_commit: Some(false),
        grace_delay_ms: Some(10),
        ..Default::default()
    });
    writer.open().await.unwrap();
    writer
        .execute("INSERT INTO events (id) VALUES (?)", &[SqlValue::BigInt(1)])
        .await
        .unwrap();

    // Uncommitted write is invisible to a second session.
    let reader = admin.open_session().await.unwrap();
    let rows = reader
        .query_typed("SELECT id FROM events", &[], &[SqlType::BigInt])
        .await
        .unwrap();
    assert!(rows.is_empty());

    writer.commit().await.unwrap();
    let rows = reader
        .query_typed("SELECT id FROM events", &[], &[SqlType::BigInt])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_rollback_discards_writes() {
    let url = sqlite_url();
    let admin = admin_for(&url);

    let setup = admin.open_session().await.unwrap();
    setup
        .execute("CREATE TABLE events (id INTEGER PRIMARY KEY)", &[])
        .await
        .unwrap();

    let writer = admin.new_session_with(SessionOptions {
        auto_commit: Some(false),
        grace_delay_ms: Some(10),
        ..Default::default()
    });
    writer.open().await.unwrap();
    writer
        .execute("INSERT INTO events (id) VALUES (?)", &[SqlValue::BigInt(1)])
        .await
        .unwrap();
    writer.rollback(None).await.unwrap();
    writer.commit().await.unwrap();

    let rows = setup
        .query_typed("SELECT id FROM events", &[], &[SqlType::BigInt])
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_savepoint_rolls_back_partially() {
    let url = sqlite_url();
    let admin = admin_for(&url);

    let setup = admin.open_session().await.unwrap();
    setup
        .execute("CREATE TABLE events (id INTEGER PRIMARY KEY)", &[])
        .await
        .unwrap();

    let writer = admin.new_session_with(SessionOptions {
        auto_commit: Some(false),
        grace_delay_ms: Some(10),
        ..Default::default()
    });
    writer.open().await.unwrap();
    writer
        .execute("INSERT INTO events (id) VALUES (?)", &[SqlValue::BigInt(1)])
        .await
        .unwrap();

    let savepoint = writer.savepoint().await.unwrap();
    writer
        .execute("INSERT INTO events (id) VALUES (?)", &[SqlValue::BigInt(2)])
        .await
        .unwrap();
    writer.rollback(Some(&savepoint)).await.unwrap();
    writer.commit().await.unwrap();

    let rows = setup
        .query_typed("SELECT id FROM events", &[], &[SqlType::BigInt])
        .await
        .unwrap();
    assert_eq!(rows, vec![vec![SqlValue::BigInt(1)]]);
}

#[tokio::test]
async fn test_end_use_outside_runtime_does_not_panic() {
    let url = sqlite_url();
    let admin = admin_for(&url);
    let session = admin.open_session().await.unwrap();
    session.use_connection().await.unwrap();

    // Release from a plain thread with no runtime context.
    let released = Arc::clone(&session);
    std::thread::spawn(move || released.end_use_connection())
        .join()
        .unwrap();
    assert_eq!(session.ref_count(), 0);

    // No deferred close could be scheduled; an explicit disconnect still works.
    session.force_disconnect().await.unwrap();
    assert!(session.is_disconnected().await);
}

#[tokio::test]
async fn test_savepoint_names_are_validated() {
    let url = sqlite_url();
    let admin = admin_for(&url);

    let writer = admin.new_session_with(SessionOptions {
        auto_commit: Some(false),
        grace_delay_ms: Some(10),
        ..Default::default()
    });
    writer.open().await.unwrap();

    let err = writer
        .rollback(Some("sp_1; DROP TABLE events"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Sql);
    assert!(err.to_string().contains("invalid savepoint name"));

    let err = writer.release_savepoint("sp 1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Sql);

    // Generated names pass.
    let name = writer.savepoint().await.unwrap();
    writer.rollback(Some(&name)).await.unwrap();
    writer.release_savepoint(&name).await.unwrap();
}

#[tokio::test]
async fn test_open_failure_is_no_connection() {
    let admin = admin_for("sqlite:///no/such/directory/steady.db");
    let session = admin.new_session();
    let err = session.open().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoConnection);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_sessions_share_one_admin_target() {
    let url = sqlite_url();
    let admin = Arc::new(admin_for(&url));

    let a = admin.open_session().await.unwrap();
    let b = admin.open_session().await.unwrap();
    assert_ne!(a.id(), b.id());

    a.execute("CREATE TABLE shared (id INTEGER)", &[]).await.unwrap();
    b.execute("INSERT INTO shared (id) VALUES (?)", &[SqlValue::BigInt(5)])
        .await
        .unwrap();
    let rows = a
        .query_typed("SELECT id FROM shared", &[], &[SqlType::BigInt])
        .await
        .unwrap();
    assert_eq!(rows, vec![vec![SqlValue::BigInt(5)]]);
}
