//! Basic example showing query analysis, lifecycle tracking and a traced
//! SeaORM connection.
//!
//! Run with: cargo run --example basic

use std::collections::BTreeMap;

use sea_orm::{ConnectionTrait, DbBackend, MockDatabase, Statement, Value};
use sql_observation::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sql_observation=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Analysis on its own
    let analyzer = QueryAnalyzer::new(AnalysisConfig::default());
    for sql in [
        "SELECT * FROM emp WHERE id = 7",
        "SELECT * FROM orders o JOIN customers c ON o.customer_id = c.id",
        "INSERT INTO audit_log (actor, action) SELECT name, 'login' FROM users",
        "{call refresh_totals(?)}",
        "not sql at all",
    ] {
        let analyzed = analyzer.analyze(sql, StatementKind::Plain, false);
        tracing::info!(
            operation = ?analyzed.operation_name(),
            collection = ?analyzed.collection_name(),
            procedure = ?analyzed.stored_procedure_name(),
            summary = ?analyzed.query_summary(),
            sanitized = analyzed.sanitized_text(),
            "Analyzed query"
        );
    }

    // Lifecycle tracking: connection -> statement -> cursor
    let tracker = ResourceTracker::new();
    let connection = ConnectionId::new(1);
    let statement = StatementId::new(1);

    let pending = tracker.on_acquire_begin(connection);
    tracker.on_acquire_end(
        pending,
        Ok(ConnectionDetails::new()
            .with_host("db.internal")
            .with_port(5432)
            .with_data_source_name("orders")),
    );
    for cursor in [CursorId::new(1), CursorId::new(2)] {
        for _ in 0..3 {
            tracker.on_cursor_advance(connection, statement, cursor, true);
        }
    }
    tracker.on_commit(connection);
    tracker.on_cursor_close(CursorId::new(1), None);
    // Closes the remaining cursor too.
    tracker.on_connection_close(connection, None);
    tracing::info!(
        open_connections = tracker.open_connections(),
        open_result_sets = tracker.open_result_sets(),
        "Lifecycle finished"
    );

    // A traced SeaORM connection, backed by the mock driver so no server is needed
    let db = MockDatabase::new(DbBackend::Postgres)
        .append_query_results([vec![BTreeMap::from([("id", Value::Int(Some(7)))])]])
        .into_connection()
        .with_tracing_config(TracingConfig::development());

    let rows = db
        .query_all(Statement::from_string(
            DbBackend::Postgres,
            "SELECT id FROM emp WHERE id = 7",
        ))
        .await?;
    tracing::info!(rows = rows.len(), "Query through traced connection finished");

    Ok(())
}
