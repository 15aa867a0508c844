//! Traced database connection wrapper.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sea_orm::{
    AccessMode, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr,
    ExecResult, IsolationLevel, QueryResult, Statement, StreamTrait, TransactionError,
    TransactionTrait,
};
use tracing::{field, Instrument, Span};

use crate::analyzer::{AnalyzedQuery, QueryAnalyzer};
use crate::ast::StatementKind;
use crate::config::{SqlDialect, TracingConfig};

/// A traced wrapper around SeaORM's `DatabaseConnection`.
///
/// Implements `ConnectionTrait`, `StreamTrait` and `TransactionTrait`, so it can
/// stand in for `DatabaseConnection` anywhere. Every statement is analyzed
/// before it runs: the span is named after the query summary and tagged with
/// the operation, the main table and, when enabled, the sanitized statement.
///
/// Spans are children of whatever span is current when the query starts.
///
/// # Example
///
/// ```rust,ignore
/// use sea_orm::Database;
/// use sql_observation::TracedConnection;
///
/// let db = Database::connect("postgres://localhost/mydb").await?;
/// let traced = TracedConnection::from(db);
///
/// // All queries are now traced
/// let users = Users::find().all(&traced).await?;
/// ```
#[derive(Debug, Clone)]
pub struct TracedConnection {
    inner: DatabaseConnection,
    config: Arc<TracingConfig>,
    analyzer: Arc<QueryAnalyzer>,
}

impl TracedConnection {
    /// Create a new traced connection with the given configuration.
    ///
    /// A [`SqlDialect::Generic`] analysis dialect is narrowed to the
    /// connection's backend.
    pub fn new(connection: DatabaseConnection, config: TracingConfig) -> Self {
        let mut analysis = config.analysis.clone();
        if analysis.dialect == SqlDialect::Generic {
            analysis.dialect = dialect_for(connection.get_database_backend());
        }

        Self {
            inner: connection,
            config: Arc::new(config),
            analyzer: Arc::new(QueryAnalyzer::new(analysis)),
        }
    }

    /// Create a new traced connection with default configuration.
    pub fn wrap(connection: DatabaseConnection) -> Self {
        Self::new(connection, TracingConfig::default())
    }

    /// Get a reference to the underlying `DatabaseConnection`.
    pub fn inner(&self) -> &DatabaseConnection {
        &self.inner
    }

    /// Get the tracing configuration.
    pub fn config(&self) -> &TracingConfig {
        &self.config
    }

    /// The analyzer naming this connection's spans.
    pub fn analyzer(&self) -> &QueryAnalyzer {
        &self.analyzer
    }

    /// Consume the wrapper and return the inner `DatabaseConnection`.
    pub fn into_inner(self) -> DatabaseConnection {
        self.inner
    }

    fn db_system(&self) -> &'static str {
        match self.inner.get_database_backend() {
            DbBackend::Postgres => "postgresql",
            DbBackend::MySql => "mysql",
            DbBackend::Sqlite => "sqlite",
        }
    }

    fn analyze(&self, stmt: &Statement) -> Arc<AnalyzedQuery> {
        let kind = if stmt.values.is_some() {
            StatementKind::Prepared
        } else {
            StatementKind::Plain
        };
        self.analyzer.analyze(&stmt.sql, kind, false)
    }

    fn create_span(&self, stmt: &Statement) -> Span {
        let analyzed = self.analyze(stmt);
        let span_name = analyzed
            .query_summary()
            .or(analyzed.operation_name())
            .unwrap_or("UNKNOWN");

        let span = tracing::info_span!(
            "db.query",
            otel.name = %span_name,
            db.system = %self.db_system(),
            db.operation = field::Empty,
            db.sql.table = field::Empty,
            db.stored_procedure.name = field::Empty,
            db.statement = field::Empty,
            db.rows_affected = field::Empty,
            db.duration_ms = field::Empty,
            db.name = field::Empty,
            server.address = field::Empty,
            server.port = field::Empty,
            peer.service = field::Empty,
            otel.status_code = field::Empty,
            error.message = field::Empty,
            slow_query = field::Empty,
        );

        if let Some(operation) = analyzed.operation_name() {
            span.record("db.operation", operation);
        }
        if let Some(table) = analyzed.collection_name() {
            span.record("db.sql.table", table);
        }
        if let Some(procedure) = analyzed.stored_procedure_name() {
            span.record("db.stored_procedure.name", procedure);
        }
        if self.config.log_statements {
            span.record("db.statement", analyzed.sanitized_text());
        }

        if let Some(db_name) = &self.config.database_name {
            span.record("db.name", db_name.as_str());
        }
        if let Some(addr) = &self.config.server_address {
            span.record("server.address", addr.as_str());
        }
        if let Some(port) = self.config.server_port {
            span.record("server.port", i64::from(port));
        }
        if let Some(peer) = &self.config.peer_service {
            span.record("peer.service", peer.as_str());
        }

        span
    }

    /// Run `operation` inside the span for `stmt` and record its outcome.
    async fn observe<T, Fut>(
        &self,
        stmt: &Statement,
        operation: Fut,
        rows: impl FnOnce(&T) -> u64,
    ) -> Result<T, DbErr>
    where
        Fut: Future<Output = Result<T, DbErr>>,
    {
        let span = self.create_span(stmt);
        let start = Instant::now();

        let result = operation.instrument(span.clone()).await;

        let row_count = result.as_ref().ok().map(rows);
        self.record_result(&span, &result, start, row_count);

        result
    }

    fn record_result<T, E: Display>(
        &self,
        span: &Span,
        result: &Result<T, E>,
        start: Instant,
        row_count: Option<u64>,
    ) {
        let elapsed = start.elapsed();
        let duration_ms = elapsed.as_millis() as i64;
        span.record("db.duration_ms", duration_ms);

        if self.config.record_row_counts {
            if let Some(count) = row_count {
                span.record("db.rows_affected", count);
            }
        }

        if elapsed > self.config.slow_query_threshold {
            span.record("slow_query", true);
            tracing::warn!(
                parent: span,
                duration_ms,
                threshold_ms = self.config.slow_query_threshold.as_millis() as i64,
                "Slow query detected"
            );
        }

        match result {
            Ok(_) => record_status(span, None),
            Err(e) => {
                record_status(span, Some(&e.to_string()));
                tracing::error!(parent: span, error = %e, "Database query failed");
            }
        }
    }

    fn transaction_span(
        &self,
        operation: &'static str,
        isolation_level: Option<&IsolationLevel>,
        access_mode: Option<&AccessMode>,
    ) -> Span {
        tracing::info_span!(
            "db.transaction",
            otel.name = operation,
            db.system = %self.db_system(),
            db.operation = operation,
            db.transaction.isolation_level = ?isolation_level,
            db.transaction.access_mode = ?access_mode,
            otel.status_code = field::Empty,
            error.message = field::Empty,
        )
    }
}

fn record_status(span: &Span, error: Option<&str>) {
    match error {
        None => {
            span.record("otel.status_code", "OK");
        }
        Some(message) => {
            span.record("otel.status_code", "ERROR");
            span.record("error.message", message);
        }
    }
}

fn dialect_for(backend: DbBackend) -> SqlDialect {
    match backend {
        DbBackend::Postgres => SqlDialect::PostgreSql,
        DbBackend::MySql => SqlDialect::MySql,
        DbBackend::Sqlite => SqlDialect::Sqlite,
    }
}

impl From<DatabaseConnection> for TracedConnection {
    fn from(connection: DatabaseConnection) -> Self {
        Self::wrap(connection)
    }
}

impl AsRef<DatabaseConnection> for TracedConnection {
    fn as_ref(&self) -> &DatabaseConnection {
        &self.inner
    }
}

#[async_trait]
impl ConnectionTrait for TracedConnection {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        let traced = stmt.clone();
        self.observe(&traced, self.inner.execute(stmt), ExecResult::rows_affected)
            .await
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        let stmt = Statement::from_string(self.get_database_backend(), sql);
        self.observe(&stmt, self.inner.execute_unprepared(sql), ExecResult::rows_affected)
            .await
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        let traced = stmt.clone();
        self.observe(&traced, self.inner.query_one(stmt), |row| u64::from(row.is_some()))
            .await
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let traced = stmt.clone();
        self.observe(&traced, self.inner.query_all(stmt), |rows| rows.len() as u64)
            .await
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

#[async_trait]
impl StreamTrait for TracedConnection {
    type Stream<'a> = <DatabaseConnection as StreamTrait>::Stream<'a>;

    fn stream<'a>(
        &'a self,
        stmt: Statement,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream<'a>, DbErr>> + 'a + Send>> {
        let span = self.create_span(&stmt);
        let start = Instant::now();

        Box::pin(async move {
            let result = self.inner.stream(stmt).instrument(span.clone()).await;
            // Rows are pulled later, so only the time to open the stream is known.
            self.record_result(&span, &result, start, None);
            result
        })
    }
}

#[async_trait]
impl TransactionTrait for TracedConnection {
    async fn begin(&self) -> Result<DatabaseTransaction, DbErr> {
        let span = self.transaction_span("BEGIN", None, None);
        let result = self.inner.begin().instrument(span.clone()).await;
        record_status(&span, result.as_ref().err().map(|e| e.to_string()).as_deref());
        result
    }

    async fn begin_with_config(
        &self,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<DatabaseTransaction, DbErr> {
        let span =
            self.transaction_span("BEGIN", isolation_level.as_ref(), access_mode.as_ref());
        let result = self
            .inner
            .begin_with_config(isolation_level, access_mode)
            .instrument(span.clone())
            .await;
        record_status(&span, result.as_ref().err().map(|e| e.to_string()).as_deref());
        result
    }

    async fn transaction<F, T, E>(&self, callback: F) -> Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        let span = self.transaction_span("TRANSACTION", None, None);
        let result = self
            .inner
            .transaction(callback)
            .instrument(span.clone())
            .await;
        record_status(&span, result.as_ref().err().map(|e| format!("{e:?}")).as_deref());
        result
    }

    async fn transaction_with_config<F, T, E>(
        &self,
        callback: F,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        let span =
            self.transaction_span("TRANSACTION", isolation_level.as_ref(), access_mode.as_ref());
        let result = self
            .inner
            .transaction_with_config(callback, isolation_level, access_mode)
            .instrument(span.clone())
            .await;
        record_status(&span, result.as_ref().err().map(|e| format!("{e:?}")).as_deref());
        result
    }
}

/// Extension trait for easy wrapping of database connections.
pub trait TracingExt {
    /// Wrap this connection with tracing instrumentation.
    fn with_tracing(self) -> TracedConnection;

    /// Wrap this connection with custom tracing configuration.
    fn with_tracing_config(self, config: TracingConfig) -> TracedConnection;
}

impl TracingExt for DatabaseConnection {
    fn with_tracing(self) -> TracedConnection {
        TracedConnection::wrap(self)
    }

    fn with_tracing_config(self, config: TracingConfig) -> TracedConnection {
        TracedConnection::new(self, config)
    }
}
