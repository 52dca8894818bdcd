mod common;

use std::time::{Duration, Instant};

use common::{Failure, MockConnection, primary_and_replica, served_by};
use dbresolver::{Context, LogicalDb, ResolverError, Value};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_ping_reaches_both_sides() -> Result<(), Box<dyn std::error::Error>> {
    let (db, primary, replica) = primary_and_replica();
    db.ping().await?;
    assert_eq!(primary.ops(), vec!["ping"]);
    assert_eq!(replica.ops(), vec!["ping"]);
    Ok(())
}

#[tokio::test]
async fn test_ping_fails_if_either_side_is_down() {
    let (db, _primary, replica) = primary_and_replica();
    replica.fail_ping(Failure::message("connection refused"));
    let err = db.ping().await.unwrap_err();
    assert_eq!(err.to_string(), "connection refused");
}

#[tokio::test]
async fn test_ping_runs_concurrently() -> Result<(), Box<dyn std::error::Error>> {
    let (db, primary, replica) = primary_and_replica();
    primary.delay_ping(Duration::from_millis(150));
    replica.delay_ping(Duration::from_millis(150));

    let started = Instant::now();
    db.ping().await?;
    assert!(started.elapsed() < Duration::from_millis(280));
    Ok(())
}

#[tokio::test]
async fn test_ping_context_tolerates_one_side_down() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::background().with_timeout(Duration::from_secs(10));

    let (db, _primary, replica) = primary_and_replica();
    replica.fail_ping(Failure::code("57P01", "terminating connection due to administrator command"));
    db.ping_context(&ctx).await?;

    let (db, primary, _replica) = primary_and_replica();
    primary.fail_ping(Failure::message("connection refused"));
    db.ping_context(&ctx).await?;
    Ok(())
}

#[tokio::test]
async fn test_ping_context_reports_primary_error_when_both_down() {
    let (db, primary, replica) = primary_and_replica();
    primary.fail_ping(Failure::message("primary: connection refused"));
    replica.fail_ping(Failure::message("replica: connection refused"));

    let err = db.ping_context(&Context::background()).await.unwrap_err();
    assert_eq!(err.to_string(), "primary: connection refused");
}

#[tokio::test]
async fn test_ping_context_without_replica_reports_primary_error() {
    let primary = MockConnection::new("primary");
    primary.fail_ping(Failure::message("connection refused"));
    let db = LogicalDb::wrap(primary, None);
    assert!(db.ping_context(&Context::background()).await.is_err());
}

#[tokio::test]
async fn test_ping_context_honors_deadline() {
    let (db, primary, replica) = primary_and_replica();
    primary.delay_ping(Duration::from_secs(5));
    replica.delay_ping(Duration::from_secs(5));

    let ctx = Context::background().with_timeout(Duration::from_millis(30));
    let err = db.ping_context(&ctx).await.unwrap_err();
    assert!(matches!(err, ResolverError::DeadlineExceeded));
}

#[tokio::test]
async fn test_close_attempts_both_sides() {
    let (db, primary, replica) = primary_and_replica();
    primary.fail_close(Failure::message("primary close failed"));

    let err = db.close().await.unwrap_err();
    assert_eq!(err.to_string(), "primary close failed");
    assert!(primary.is_closed());
    assert!(replica.is_closed());
}

#[tokio::test]
async fn test_close_reports_replica_failure() {
    let (db, primary, replica) = primary_and_replica();
    replica.fail_close(Failure::message("replica close failed"));

    let err = db.close().await.unwrap_err();
    assert_eq!(err.to_string(), "replica close failed");
    assert!(primary.is_closed());
}

#[tokio::test]
async fn test_pool_settings_apply_to_both_sides() {
    let (db, primary, replica) = primary_and_replica();
    db.set_max_open_conns(100);
    db.set_max_idle_conns(10);
    db.set_conn_max_lifetime(Duration::from_secs(300));

    for conn in [&primary, &replica] {
        assert_eq!(conn.max_idle(), Some(10));
        assert_eq!(conn.max_lifetime(), Some(Duration::from_secs(300)));
    }
    let stats = db.stats();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|s| s.max_open == 100));
}

#[tokio::test]
async fn test_pool_settings_without_replica() {
    let primary = MockConnection::new("primary");
    let db = LogicalDb::wrap(primary.clone(), None);
    db.set_max_idle_conns(0);
    assert_eq!(primary.max_idle(), Some(0));
    assert_eq!(db.stats().len(), 1);
    assert_eq!(db.driver_name(), "mock");
}

#[tokio::test]
async fn test_prepare_mirrors_to_both_sides() -> Result<(), Box<dyn std::error::Error>> {
    let (db, primary, replica) = primary_and_replica();
    let sql = "SELECT name FROM users WHERE id = $1";
    let stmt = db.prepare(sql).await?;

    let rows = stmt.query(&[Value::from(1)]).await?;
    assert_eq!(served_by(&rows), "replica");
    stmt.exec(&[Value::from(1)]).await?;
    stmt.close().await?;

    assert_eq!(primary.ops(), vec!["prepare", "stmt_exec", "stmt_close"]);
    assert_eq!(replica.ops(), vec!["prepare", "stmt_query", "stmt_close"]);
    Ok(())
}

#[tokio::test]
async fn test_statement_close_attempts_both_sides() -> Result<(), Box<dyn std::error::Error>> {
    let (db, primary, replica) = primary_and_replica();
    let stmt = db.prepare("SELECT 1").await?;
    replica.fail_statement_close(Failure::code("08003", "connection does not exist"));

    let err = stmt.close().await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("08003"));
    assert_eq!(primary.ops(), vec!["prepare", "stmt_close"]);
    assert_eq!(replica.ops(), vec!["prepare", "stmt_close"]);

    // A primary failure wins over the replica's.
    let stmt = db.prepare("SELECT 2").await?;
    primary.fail_statement_close(Failure::message("bad connection"));
    let err = stmt.close().await.unwrap_err();
    assert_eq!(err.to_string(), "bad connection");
    assert_eq!(replica.ops().last(), Some(&"stmt_close"));
    Ok(())
}

#[tokio::test]
async fn test_prepare_fails_if_either_side_fails() {
    let (db, _primary, replica) = primary_and_replica();
    replica.fail_prepare(Failure::code("42P01", "relation \"users\" does not exist"));

    let err = db.prepare("SELECT * FROM users").await.err();
    assert_eq!(err.and_then(|e| e.sqlstate().map(str::to_string)), Some("42P01".to_string()));
}

#[tokio::test]
async fn test_statement_reads_fall_back_on_connection_failure() -> Result<(), Box<dyn std::error::Error>> {
    let (db, primary, replica) = primary_and_replica();
    let stmt = db.prepare_context(&Context::background(), "SELECT 1").await?;
    replica.fail_queries(Failure::code("08006", "connection failure"));

    let rows = stmt.query(&[]).await?;
    assert_eq!(served_by(&rows), "primary");
    let (name,): (String,) = stmt.query_row(&[]).await.scan()?;
    assert_eq!(name, "primary");

    assert_eq!(primary.ops(), vec!["prepare", "stmt_query", "stmt_query"]);
    Ok(())
}

#[tokio::test]
async fn test_statement_application_error_is_returned() -> Result<(), Box<dyn std::error::Error>> {
    let (db, primary, replica) = primary_and_replica();
    let stmt = db.prepare("SELECT 1 / $1").await?;
    replica.fail_queries(Failure::code("22012", "division by zero"));

    let row = stmt.query_row_context(&Context::background(), &[Value::from(0)]).await;
    assert_eq!(row.err().and_then(|e| e.sqlstate()), Some("22012"));
    assert_eq!(primary.ops(), vec!["prepare"]);
    Ok(())
}

#[tokio::test]
async fn test_statement_without_replica() -> Result<(), Box<dyn std::error::Error>> {
    let primary = MockConnection::new("primary");
    let db = LogicalDb::wrap(primary.clone(), None);
    let stmt = db.prepare("SELECT 1").await?;
    let rows = stmt.query_context(&Context::background(), &[]).await?;
    assert_eq!(served_by(&rows), "primary");
    stmt.exec_context(&Context::background(), &[]).await?;
    stmt.close().await?;
    assert_eq!(primary.ops(), vec!["prepare", "stmt_query", "stmt_exec", "stmt_close"]);
    Ok(())
}
