//! # sql-observation
//!
//! SQL query analysis and resource lifecycle tracking for database observability.
//!
//! The crate turns raw SQL text into the handful of attributes a trace needs and
//! keeps the scopes opened for connections and cursors balanced, so every span
//! that starts also ends.
//!
//! ## Features
//!
//! - **Query Analysis**: Operation name, main table or procedure, a bounded query
//!   summary and literal-free statement text for any SQL string
//! - **Memoized**: Results are cached by query text in a bounded LRU cache
//! - **Never Fails**: Unparseable or slow-to-analyze SQL degrades to the raw text
//! - **Lifecycle Tracking**: Connection, statement and cursor scopes are stopped
//!   exactly once, including cascading closes
//! - **SeaORM Integration**: `TracedConnection` names and tags a span for every query
//!
//! ## Quick Start
//!
//! ```rust
//! use sql_observation::{AnalysisConfig, QueryAnalyzer, StatementKind};
//!
//! let analyzer = QueryAnalyzer::new(AnalysisConfig::default());
//! let analyzed = analyzer.analyze(
//!     "SELECT * FROM orders o JOIN customers c ON o.customer_id = c.id WHERE c.id = 42",
//!     StatementKind::Plain,
//!     false,
//! );
//!
//! assert_eq!(analyzed.query_summary(), Some("SELECT orders customers"));
//! assert_eq!(analyzed.collection_name(), None);
//! ```
//!
//! ## With SeaORM
//!
//! ```rust,ignore
//! use sea_orm::Database;
//! use sql_observation::{TracedConnection, TracingConfig};
//!
//! let db = Database::connect("postgres://localhost/mydb").await?;
//! let traced_db = TracedConnection::new(db, TracingConfig::production());
//!
//! let users = Users::find().all(&traced_db).await?;
//! ```
//!
//! ## Span Attributes
//!
//! Query spans carry these OpenTelemetry semantic convention attributes:
//!
//! | Attribute | Description |
//! |-----------|-------------|
//! | `otel.name` | Query summary, e.g. `SELECT orders customers` |
//! | `db.system` | "postgresql", "mysql", or "sqlite" |
//! | `db.operation` | SQL operation (SELECT, INSERT, CALL, BATCH UPDATE, ...) |
//! | `db.sql.table` | Main table, when there is exactly one |
//! | `db.stored_procedure.name` | Procedure named by a CALL |
//! | `db.statement` | Statement with literals replaced by `?` (when enabled) |
//! | `db.rows_affected` | Number of rows returned/affected |
//! | `otel.status_code` | "OK" or "ERROR" |
//! | `error.message` | Error details (on failure) |

pub mod ast;
mod analyzer;
mod cache;
mod classifier;
mod config;
mod connection;
mod error;
pub mod parser;
mod sanitizer;
mod summary;
pub mod tracker;

pub use analyzer::{AnalyzedQuery, QueryAnalyzer, QueryAnalyzerBuilder};
pub use ast::StatementKind;
pub use cache::{AnalysisCache, CacheKey};
pub use classifier::{classify, ClassificationResult, EntryKind, VisitedEntry};
pub use config::{AnalysisConfig, SqlDialect, TracingConfig};
pub use connection::{TracedConnection, TracingExt};
pub use error::AnalysisError;
pub use sanitizer::{QuerySanitizer, SanitizePolicy};
pub use summary::{QuerySummaryBuilder, SummaryPolicy};
pub use tracker::ResourceTracker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::tracker::{ConnectionDetails, ConnectionId, CursorId, StatementId};
    pub use crate::{
        AnalysisConfig, QueryAnalyzer, ResourceTracker, StatementKind, TracedConnection,
        TracingConfig, TracingExt,
    };
}
