//! Identities and the records the tracker keeps per resource.

use std::collections::HashSet;
use std::error::Error;
use std::fmt;

use chrono::{DateTime, Utc};

use super::scope::{ObservationScope, ScopeAttribute};

macro_rules! identity {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

identity!(
    /// Opaque identity of a client session.
    ConnectionId
);
identity!(
    /// Opaque identity of a statement.
    StatementId
);
identity!(
    /// Opaque identity of a row cursor.
    CursorId
);

/// Where an acquired connection points.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionDetails {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_source_name: Option<String>,
}

impl ConnectionDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_data_source_name(mut self, name: impl Into<String>) -> Self {
        self.data_source_name = Some(name.into());
        self
    }
}

pub(crate) struct ConnectionAttributes<S> {
    pub(crate) connection_id: ConnectionId,
    pub(crate) details: ConnectionDetails,
    pub(crate) scope: S,
    pub(crate) committed_at: Option<DateTime<Utc>>,
    pub(crate) rolled_back_at: Option<DateTime<Utc>>,
    pub(crate) open_result_sets: HashSet<CursorId>,
}

impl<S: ObservationScope> ConnectionAttributes<S> {
    pub(crate) fn new(connection_id: ConnectionId, details: ConnectionDetails, mut scope: S) -> Self {
        if let Some(host) = &details.host {
            scope.tag(ScopeAttribute::ServerAddress, host);
        }
        if let Some(port) = details.port {
            scope.tag(ScopeAttribute::ServerPort, &port.to_string());
        }
        if let Some(name) = &details.data_source_name {
            scope.tag(ScopeAttribute::DataSourceName, name);
        }

        Self {
            connection_id,
            details,
            scope,
            committed_at: None,
            rolled_back_at: None,
            open_result_sets: HashSet::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> ConnectionSnapshot {
        let mut open_result_sets: Vec<CursorId> = self.open_result_sets.iter().copied().collect();
        open_result_sets.sort_unstable();
        ConnectionSnapshot {
            connection_id: self.connection_id,
            details: self.details.clone(),
            committed_at: self.committed_at,
            rolled_back_at: self.rolled_back_at,
            open_result_sets,
        }
    }
}

pub(crate) struct ResultSetAttributes<S> {
    pub(crate) cursor_id: CursorId,
    pub(crate) statement_id: StatementId,
    pub(crate) connection_id: ConnectionId,
    pub(crate) row_count: u64,
    pub(crate) is_generated_keys_cursor: bool,
    pub(crate) scope: S,
}

impl<S: ObservationScope> ResultSetAttributes<S> {
    pub(crate) fn snapshot(&self) -> ResultSetSnapshot {
        ResultSetSnapshot {
            cursor_id: self.cursor_id,
            statement_id: self.statement_id,
            connection_id: self.connection_id,
            row_count: self.row_count,
            is_generated_keys_cursor: self.is_generated_keys_cursor,
        }
    }

    /// Tag the final row count and stop the scope.
    pub(crate) fn stop(mut self, error: Option<&(dyn Error + 'static)>) {
        self.scope
            .tag(ScopeAttribute::RowCount, &self.row_count.to_string());
        self.scope.stop(error);
    }
}

/// Point-in-time view of an indexed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub connection_id: ConnectionId,
    pub details: ConnectionDetails,
    pub committed_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    /// Cursors still open under this connection, in ascending order.
    pub open_result_sets: Vec<CursorId>,
}

/// Point-in-time view of an open cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultSetSnapshot {
    pub cursor_id: CursorId,
    pub statement_id: StatementId,
    pub connection_id: ConnectionId,
    pub row_count: u64,
    pub is_generated_keys_cursor: bool,
}
