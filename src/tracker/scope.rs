//! Boundary with the observability backend.
//!
//! The tracker only ever talks to [`ScopeFactory`] and [`ObservationScope`].
//! [`TracingScopes`] is the default backend and maps scopes onto `tracing` spans.

use std::error::Error;

use tracing::{field, Span};

use super::attributes::{ConnectionId, CursorId, StatementId};

/// What a scope is being opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeContext {
    Connection {
        connection_id: ConnectionId,
    },
    ResultSet {
        connection_id: ConnectionId,
        statement_id: StatementId,
        cursor_id: CursorId,
        generated_keys: bool,
    },
}

/// String-valued attributes the tracker attaches to scopes.
///
/// How each one is named on the wire is up to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeAttribute {
    ServerAddress,
    ServerPort,
    DataSourceName,
    RowCount,
}

/// An open observability context.
///
/// [`stop`](ObservationScope::stop) consumes the scope, so a scope can only be
/// stopped once.
pub trait ObservationScope: Send + Sync {
    fn tag(&mut self, attribute: ScopeAttribute, value: &str);

    /// Record a point-in-time event such as a commit.
    fn event(&self, _name: &'static str) {}

    /// Run `f` with this scope as the current context.
    fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R
    where
        Self: Sized,
    {
        f()
    }

    /// Close the scope, marking it failed when `error` is set.
    fn stop(self, error: Option<&(dyn Error + 'static)>)
    where
        Self: Sized;
}

/// Opens scopes for the tracker.
pub trait ScopeFactory: Send + Sync {
    type Scope: ObservationScope;

    fn open(&self, context: &ScopeContext) -> Self::Scope;
}

/// Scopes backed by `tracing` spans.
///
/// Spans are children of whatever span is current when the scope opens.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingScopes;

/// A `tracing` span that closes when the scope stops.
#[derive(Debug)]
pub struct TracingScope {
    span: Span,
}

impl TracingScope {
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl ScopeFactory for TracingScopes {
    type Scope = TracingScope;

    fn open(&self, context: &ScopeContext) -> TracingScope {
        let span = match *context {
            ScopeContext::Connection { connection_id } => tracing::info_span!(
                "db.connection",
                otel.name = "connection",
                db.connection.id = connection_id.get(),
                server.address = field::Empty,
                server.port = field::Empty,
                db.name = field::Empty,
                otel.status_code = field::Empty,
                error.message = field::Empty,
            ),
            ScopeContext::ResultSet {
                connection_id,
                statement_id,
                cursor_id,
                generated_keys,
            } => {
                let name = if generated_keys {
                    "generated-keys"
                } else {
                    "result-set"
                };
                tracing::info_span!(
                    "db.result_set",
                    otel.name = name,
                    db.connection.id = connection_id.get(),
                    db.statement.id = statement_id.get(),
                    db.cursor.id = cursor_id.get(),
                    db.response.returned_rows = field::Empty,
                    otel.status_code = field::Empty,
                    error.message = field::Empty,
                )
            }
        };
        TracingScope { span }
    }
}

impl ObservationScope for TracingScope {
    fn tag(&mut self, attribute: ScopeAttribute, value: &str) {
        let field = match attribute {
            ScopeAttribute::ServerAddress => "server.address",
            ScopeAttribute::ServerPort => "server.port",
            ScopeAttribute::DataSourceName => "db.name",
            ScopeAttribute::RowCount => "db.response.returned_rows",
        };
        self.span.record(field, value);
    }

    fn event(&self, name: &'static str) {
        tracing::info!(parent: &self.span, event = name, "Connection event");
    }

    fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        self.span.in_scope(f)
    }

    fn stop(self, error: Option<&(dyn Error + 'static)>) {
        match error {
            None => {
                self.span.record("otel.status_code", "OK");
            }
            Some(e) => {
                self.span.record("otel.status_code", "ERROR");
                self.span.record("error.message", e.to_string().as_str());
                tracing::error!(parent: &self.span, error = %e, "Resource closed with error");
            }
        }
    }
}
