//! Integration tests for the admin surface: registry housekeeping and the
//! shared identifier sequence.

use std::collections::HashSet;
use std::sync::Arc;
use steady_db::{Admin, ConnectTarget, PreparedRequest, SessionOptions, VendorKind};
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

fn admin_for(url: &str) -> Admin {
    Admin::with_options(
        ConnectTarget::new(url).unwrap(),
        SessionOptions {
            grace_delay_ms: Some(10),
            ..Default::default()
        },
    )
    .unwrap()
}

#[test]
fn test_vendor_detection_is_lazy() {
    // No connection is attempted until a session opens.
    let pg = Admin::connect("postgres://user@db.example/app").unwrap();
    assert_eq!(pg.vendor(), VendorKind::Postgres);
    let mysql = Admin::connect("mysql://user@db.example/app").unwrap();
    assert_eq!(mysql.vendor(), VendorKind::MySql);
    let sqlite = Admin::connect("sqlite:///tmp/app.db").unwrap();
    assert_eq!(sqlite.vendor(), VendorKind::Sqlite);

    assert!(Admin::connect("oracle://db.example/app").is_err());
}

#[tokio::test]
async fn test_sequence_is_monotonic_and_resettable() {
    let url = sqlite_url();
    let admin = admin_for(&url);

    // Safe to repeat.
    admin.create_schema().await.unwrap();
    admin.create_schema().await.unwrap();

    let first = admin.next_sequence_value().await.unwrap();
    let second = admin.next_sequence_value().await.unwrap();
    assert_eq!(second, first + 1);

    admin.reset_sequence(100).await.unwrap();
    assert_eq!(admin.next_sequence_value().await.unwrap(), 100);
    assert_eq!(admin.next_sequence_value().await.unwrap(), 101);
}

#[tokio::test]
async fn test_sequence_values_unique_under_concurrent_callers() {
    let url = sqlite_url();
    let admin = Arc::new(admin_for(&url));
    admin.create_schema().await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let admin = Arc::clone(&admin);
        tasks.push(tokio::spawn(async move {
            let mut values = Vec::with_capacity(50);
            for _ in 0..50 {
                values.push(admin.next_sequence_value().await.unwrap());
            }
            values
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(
        unique.len(),
        all.len(),
        "duplicate sequence values issued: {} of {} unique",
        unique.len(),
        all.len()
    );
}

#[tokio::test]
async fn test_close_all_clears_registry_and_never_raises() {
    let url = sqlite_url();
    let admin = admin_for(&url);

    let a = admin.open_session().await.unwrap();
    let b = admin.open_session().await.unwrap();
    let c = admin.open_session().await.unwrap();
    assert_eq!(admin.registry().len(), 3);

    admin.close_all().await;
    assert_eq!(admin.registry().len(), 0);
    assert!(a.is_disconnected().await);
    assert!(b.is_disconnected().await);
    assert!(c.is_disconnected().await);

    // Repeating on an empty registry is harmless.
    admin.close_all().await;
}

#[tokio::test]
async fn test_close_all_ignores_in_use_marker() {
    let url = sqlite_url();
    let admin = admin_for(&url);

    let session = admin.open_session().await.unwrap();
    session.use_connection().await.unwrap();

    // Shutdown closes even sessions with logical users.
    admin.close_all().await;
    assert!(session.is_disconnected().await);
}

#[tokio::test]
async fn test_check_all_heals_broken_sessions() {
    let url = sqlite_url();
    let admin = admin_for(&url);

    let healthy = admin.open_session().await.unwrap();
    let broken = admin.open_session().await.unwrap();
    broken.mark_disconnected().await;

    assert_eq!(admin.check_all().await, 0);
    assert!(!healthy.is_disconnected().await);
    assert!(!broken.is_disconnected().await);
}

#[tokio::test]
async fn test_check_all_counts_unrecoverable_sessions() {
    let url = sqlite_url();
    let admin = admin_for(&url);

    let session = admin.open_session().await.unwrap();
    session
        .execute("CREATE TABLE doomed (id INTEGER)", &[])
        .await
        .unwrap();
    let tracked = PreparedRequest::new(&session, "SELECT id FROM doomed")
        .await
        .unwrap();
    tracked.track();
    session.execute("DROP TABLE doomed", &[]).await.unwrap();
    session.mark_disconnected().await;

    // Renew succeeds but the replay of the dropped-table statement fails,
    // so this session counts as a failure.
    assert_eq!(admin.check_all().await, 1);
    assert!(!session.is_disconnected().await);
    assert_eq!(admin.check_all().await, 0);
}

#[tokio::test]
async fn test_dropped_sessions_fall_out_of_registry() {
    let url = sqlite_url();
    let admin = admin_for(&url);

    let session = admin.open_session().await.unwrap();
    assert_eq!(admin.registry().len(), 1);
    let id = session.id().unwrap();

    drop(session);
    assert_eq!(admin.registry().len(), 0);
    assert!(admin.registry().get(id).is_none());
}
