//! Castellan Core Integration Tests

use castellan_core::config::{AliasConfig, FacilityConfig, StoreKind};
use castellan_core::domain::activity;
use castellan_core::domain::session::interceptor::INTERCEPTOR_KEY;
use castellan_core::domain::session::Interceptor;
use castellan_core::domain::transaction::{Transaction, TransactionError, TransactionStatus};
use castellan_core::facility::{FacilityBuilder, SessionFacility};
use castellan_core::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Facility over two file-backed databases, each with a blogs table
async fn two_db_facility(dir: &TempDir) -> SessionFacility {
    let facility = FacilityBuilder::new()
        .database(AliasConfig::new("db1", dir.path().join("db1.sqlite")))
        .database(AliasConfig::new("db2", dir.path().join("db2.sqlite")))
        .build()
        .await
        .expect("facility");

    for alias in ["db1", "db2"] {
        let session = facility.open_session_for(alias).await.expect("open");
        session
            .execute(
                "CREATE TABLE blogs (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
                vec![],
            )
            .await
            .expect("create blogs");
        session
            .execute(
                "CREATE TABLE blog_items (id INTEGER PRIMARY KEY, \
                 blog_id INTEGER NOT NULL REFERENCES blogs(id), text TEXT)",
                vec![],
            )
            .await
            .expect("create blog_items");
        session.close().await.expect("close");
    }
    facility
}

async fn count_blogs(facility: &SessionFacility, alias: &str) -> i64 {
    let session = facility.open_session_for(alias).await.expect("open");
    let count = session
        .fetch_scalar("SELECT COUNT(*) FROM blogs", vec![])
        .await
        .expect("count");
    session.close().await.expect("close");
    count
}

#[tokio::test]
async fn test_two_databases_are_independent() {
    let dir = TempDir::new().expect("tempdir");
    let facility = two_db_facility(&dir).await;

    activity::scope(async {
        let s1 = facility.open_session_for("db1").await.expect("db1");
        let s2 = facility.open_session_for("db2").await.expect("db2");
        assert!(!s1.shares_session_with(&s2));

        s1.execute(
            "INSERT INTO blogs (name) VALUES (?)",
            vec!["hammett".into()],
        )
        .await
        .expect("insert db1");
        s2.execute(
            "INSERT INTO blogs (name) VALUES (?)",
            vec!["hammett".into()],
        )
        .await
        .expect("insert db2");

        s1.close().await.expect("close db1");
        s2.close().await.expect("close db2");
    })
    .await;

    activity::scope(async {
        assert_eq!(count_blogs(&facility, "db1").await, 1);
        assert_eq!(count_blogs(&facility, "db2").await, 1);
    })
    .await;
}

#[tokio::test]
async fn test_repeated_opens_share_one_session() {
    let facility = FacilityBuilder::new()
        .in_memory_database("default")
        .build()
        .await
        .expect("facility");

    activity::scope(async {
        let first = facility.open_session().await.expect("first");
        let second = facility.open_session().await.expect("second");
        let third = facility.open_session().await.expect("third");

        assert!(first.can_close());
        assert!(!second.can_close());
        assert!(!third.can_close());
        assert!(first.shares_session_with(&second));
        assert!(first.shares_session_with(&third));

        // Closing the non-owners leaves the session stored
        third.close().await.expect("close third");
        second.close().await.expect("close second");
        let store = facility.session_manager().store();
        assert!(!store
            .is_current_activity_empty_for("default")
            .expect("is_empty"));

        first.close().await.expect("close first");
        assert!(store
            .is_current_activity_empty_for("default")
            .expect("is_empty"));
    })
    .await;
}

#[tokio::test]
async fn test_unconfigured_alias_is_rejected() {
    let facility = FacilityBuilder::new()
        .in_memory_database("db1")
        .build()
        .await
        .expect("facility");

    activity::scope(async {
        let err = facility
            .open_session_for("db2")
            .await
            .expect_err("unknown alias");
        assert!(matches!(err, Error::UnknownAlias(_)));
        assert_eq!(err.code(), "E001");
        assert_eq!(err.suggestion(), Some("castellan aliases".to_string()));

        let err = facility
            .open_stateless_session_for("db2")
            .await
            .expect_err("unknown alias stateless");
        assert!(matches!(err, Error::UnknownAlias(_)));
    })
    .await;
}

struct Counting {
    count: AtomicUsize,
}

impl Counting {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
        })
    }
}

impl Interceptor for Counting {
    fn on_prepare_statement(&self, sql: String) -> String {
        self.count.fetch_add(1, Ordering::SeqCst);
        sql
    }
}

#[tokio::test]
async fn test_alias_interceptor_takes_precedence_over_global() {
    let for_db1 = Counting::new();
    let global = Counting::new();

    let facility = FacilityBuilder::new()
        .in_memory_database("db1")
        .in_memory_database("db2")
        .alias_interceptor("db1", for_db1.clone())
        .interceptor(INTERCEPTOR_KEY, global.clone())
        .build()
        .await
        .expect("facility");

    activity::scope(async {
        let s1 = facility.open_session_for("db1").await.expect("db1");
        s1.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", vec![])
            .await
            .expect("create");
        s1.close().await.expect("close");

        assert_eq!(for_db1.count.load(Ordering::SeqCst), 1);
        assert_eq!(global.count.load(Ordering::SeqCst), 0);

        let s2 = facility.open_session_for("db2").await.expect("db2");
        s2.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", vec![])
            .await
            .expect("create");
        s2.close().await.expect("close");

        assert_eq!(for_db1.count.load(Ordering::SeqCst), 1);
        assert_eq!(global.count.load(Ordering::SeqCst), 1);
    })
    .await;
}

#[tokio::test]
async fn test_transaction_commit_persists_buffered_work() {
    let dir = TempDir::new().expect("tempdir");
    let facility = two_db_facility(&dir).await;

    activity::scope(async {
        let txn = Transaction::begin();
        let session = txn
            .wrap(async {
                let session = facility.open_session_for("db1").await.expect("open");
                // Inside a transaction the caller never owns the teardown
                assert!(!session.can_close());
                session
                    .save(
                        "INSERT INTO blogs (name) VALUES (?)",
                        vec!["persisted".into()],
                    )
                    .await
                    .expect("save");
                session
            })
            .await;

        txn.commit().await.expect("commit");
        assert_eq!(txn.status(), TransactionStatus::Committed);
        assert!(session.is_unregistered());
        assert!(facility
            .session_manager()
            .store()
            .is_current_activity_empty_for("db1")
            .expect("is_empty"));

        // The native session was torn down with the transaction
        let err = session
            .fetch_scalar("SELECT COUNT(*) FROM blogs", vec![])
            .await
            .expect_err("session closed");
        assert!(matches!(err, Error::SessionClosed));
    })
    .await;

    activity::scope(async {
        assert_eq!(count_blogs(&facility, "db1").await, 1);
    })
    .await;
}

#[tokio::test]
async fn test_transaction_rollback_leaves_tables_empty() {
    let dir = TempDir::new().expect("tempdir");
    let facility = two_db_facility(&dir).await;

    activity::scope(async {
        let txn = Transaction::begin();
        txn.wrap(async {
            let session = facility.open_session_for("db1").await.expect("open");
            session
                .execute(
                    "INSERT INTO blogs (name) VALUES (?)",
                    vec!["immediate".into()],
                )
                .await
                .expect("insert");
            session
                .save(
                    "INSERT INTO blogs (name) VALUES (?)",
                    vec!["buffered".into()],
                )
                .await
                .expect("save");
        })
        .await;

        txn.rollback().await.expect("rollback");
        assert_eq!(txn.status(), TransactionStatus::RolledBack);
    })
    .await;

    activity::scope(async {
        assert_eq!(count_blogs(&facility, "db1").await, 0);
    })
    .await;
}

#[tokio::test]
async fn test_transaction_spanning_two_databases_commits_both() {
    let dir = TempDir::new().expect("tempdir");
    let facility = two_db_facility(&dir).await;

    activity::scope(async {
        let txn = Transaction::begin();
        txn.wrap(async {
            let s1 = facility.open_session_for("db1").await.expect("db1");
            let s2 = facility.open_session_for("db2").await.expect("db2");
            s1.save("INSERT INTO blogs (name) VALUES (?)", vec!["one".into()])
                .await
                .expect("save db1");
            s2.save("INSERT INTO blogs (name) VALUES (?)", vec!["two".into()])
                .await
                .expect("save db2");
        })
        .await;

        assert_eq!(txn.participant_count(), 2);
        txn.commit().await.expect("commit");
    })
    .await;

    activity::scope(async {
        assert_eq!(count_blogs(&facility, "db1").await, 1);
        assert_eq!(count_blogs(&facility, "db2").await, 1);
    })
    .await;
}

#[tokio::test]
async fn test_prepare_failure_rolls_back_every_database() {
    let dir = TempDir::new().expect("tempdir");
    let facility = two_db_facility(&dir).await;

    activity::scope(async {
        let txn = Transaction::begin();
        txn.wrap(async {
            let s1 = facility.open_session_for("db1").await.expect("db1");
            let s2 = facility.open_session_for("db2").await.expect("db2");
            s1.save("INSERT INTO blogs (name) VALUES (?)", vec!["good".into()])
                .await
                .expect("save db1");
            // This flush will fail at prepare time
            s2.save("INSERT INTO missing_table (name) VALUES (?)", vec!["bad".into()])
                .await
                .expect("save db2");
        })
        .await;

        let err = txn.commit().await.expect_err("commit must fail");
        assert!(matches!(err, TransactionError::PrepareFailed { .. }));
        assert_eq!(txn.status(), TransactionStatus::RolledBack);
    })
    .await;

    activity::scope(async {
        assert_eq!(count_blogs(&facility, "db1").await, 0);
        assert_eq!(count_blogs(&facility, "db2").await, 0);
    })
    .await;
}

#[tokio::test]
async fn test_failed_transactions_do_not_wedge_the_alias() {
    let dir = TempDir::new().expect("tempdir");
    let facility = two_db_facility(&dir).await;

    activity::scope(async {
        for _ in 0..3 {
            let txn = Transaction::begin();
            txn.wrap(async {
                let session = facility.open_session_for("db1").await.expect("open");
                session
                    .save("INSERT INTO missing_table (x) VALUES (1)", vec![])
                    .await
                    .expect("save");
            })
            .await;
            txn.commit().await.expect_err("commit must fail");
            assert!(facility
                .session_manager()
                .store()
                .is_current_activity_empty_for("db1")
                .expect("is_empty"));
        }

        // A later transaction on the same alias still works
        let txn = Transaction::begin();
        txn.wrap(async {
            let session = facility.open_session_for("db1").await.expect("open");
            session
                .save("INSERT INTO blogs (name) VALUES (?)", vec!["alive".into()])
                .await
                .expect("save");
        })
        .await;
        txn.commit().await.expect("commit");
    })
    .await;

    activity::scope(async {
        assert_eq!(count_blogs(&facility, "db1").await, 1);
    })
    .await;
}

#[tokio::test]
async fn test_stateless_sessions_write_immediately_and_share() {
    let dir = TempDir::new().expect("tempdir");
    let facility = two_db_facility(&dir).await;

    activity::scope(async {
        let first = facility
            .open_stateless_session_for("db1")
            .await
            .expect("first");
        let second = facility
            .open_stateless_session_for("db1")
            .await
            .expect("second");
        assert!(first.can_close());
        assert!(!second.can_close());
        assert!(first.shares_session_with(&second));

        first
            .execute(
                "INSERT INTO blogs (name) VALUES (?)",
                vec!["stateless".into()],
            )
            .await
            .expect("insert");
        let count = second
            .fetch_scalar("SELECT COUNT(*) FROM blogs", vec![])
            .await
            .expect("count");
        assert_eq!(count, 1);

        second.close().await.expect("close second");
        first.close().await.expect("close first");
        assert!(facility
            .session_manager()
            .store()
            .is_current_activity_empty_for("db1")
            .expect("is_empty"));
    })
    .await;
}

#[tokio::test]
async fn test_stateless_session_in_transaction_rolls_back() {
    let dir = TempDir::new().expect("tempdir");
    let facility = two_db_facility(&dir).await;

    activity::scope(async {
        let txn = Transaction::begin();
        txn.wrap(async {
            let session = facility
                .open_stateless_session_for("db1")
                .await
                .expect("open");
            assert!(!session.can_close());
            session
                .execute("INSERT INTO blogs (name) VALUES (?)", vec!["gone".into()])
                .await
                .expect("insert");
        })
        .await;

        txn.rollback().await.expect("rollback");
        assert!(facility
            .session_manager()
            .store()
            .is_current_activity_empty_for("db1")
            .expect("is_empty"));
    })
    .await;

    activity::scope(async {
        assert_eq!(count_blogs(&facility, "db1").await, 0);
    })
    .await;
}

#[tokio::test]
async fn test_activity_scopes_do_not_share_sessions() {
    let facility = FacilityBuilder::new()
        .in_memory_database("default")
        .build()
        .await
        .expect("facility");

    let first_id = activity::scope(async {
        let session = facility.open_session().await.expect("open");
        let id = session.id();
        session.close().await.expect("close");
        id
    })
    .await;

    let second_id = activity::scope(async {
        let session = facility.open_session().await.expect("open");
        assert!(session.can_close(), "fresh scope opens a fresh session");
        let id = session.id();
        session.close().await.expect("close");
        id
    })
    .await;

    assert_ne!(first_id, second_id);
}

#[tokio::test]
async fn test_request_store_scopes_sessions_per_request() {
    let facility = FacilityBuilder::new()
        .in_memory_database("default")
        .session_store(StoreKind::Request)
        .build()
        .await
        .expect("facility");

    let err = facility.open_session().await.expect_err("no request scope");
    assert!(matches!(err, Error::NoActiveRequest));
    assert_eq!(err.code(), "E003");

    let first_id = activity::request_scope(async {
        let session = facility.open_session().await.expect("open");
        let shared = facility.open_session().await.expect("shared");
        assert!(session.shares_session_with(&shared));
        let id = session.id();
        shared.close().await.expect("close shared");
        session.close().await.expect("close");
        id
    })
    .await;

    let second_id = activity::request_scope(async {
        let session = facility.open_session().await.expect("open");
        let id = session.id();
        session.close().await.expect("close");
        id
    })
    .await;

    assert_ne!(first_id, second_id);
}

#[tokio::test]
async fn test_facility_from_config_file() {
    let dir = TempDir::new().expect("tempdir");
    let config_path = dir.path().join("config.toml");

    let mut config = FacilityConfig::default();
    config
        .databases
        .push(AliasConfig::new("db1", dir.path().join("db1.sqlite")));
    config.save_to(&config_path).expect("save config");

    let facility = FacilityBuilder::from_config_path(&config_path)
        .expect("load config")
        .build()
        .await
        .expect("build");
    assert_eq!(facility.aliases(), vec!["db1"]);
    facility.health_check("db1").await.expect("healthy");

    activity::scope(async {
        let session = facility.open_session_for("db1").await.expect("open");
        session
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", vec![])
            .await
            .expect("create");
        session.close().await.expect("close");
    })
    .await;

    facility.close().await;
}

#[tokio::test]
async fn test_finished_transaction_rejects_further_work() {
    let dir = TempDir::new().expect("tempdir");
    let facility = two_db_facility(&dir).await;

    activity::scope(async {
        let txn = Transaction::begin();
        txn.wrap(async {
            let session = facility.open_session_for("db1").await.expect("open");
            session
                .save("INSERT INTO blogs (name) VALUES (?)", vec!["once".into()])
                .await
                .expect("save");
        })
        .await;
        txn.commit().await.expect("commit");

        let err = txn.commit().await.expect_err("double commit");
        assert!(matches!(err, TransactionError::InvalidState { .. }));
        let err = txn.rollback().await.expect_err("rollback after commit");
        assert!(matches!(err, TransactionError::InvalidState { .. }));
    })
    .await;
}
