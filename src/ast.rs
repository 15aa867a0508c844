//! Closed statement model consumed by the classifier.
//!
//! The parser boundary lowers whatever the SQL grammar produces into these
//! tagged variants, so classification is a pure function over plain data.

use std::fmt;

/// How the caller prepared a statement before handing it to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Text sent as-is, literals inline.
    Plain,
    /// Text with bind placeholders, values sent separately.
    Prepared,
    /// Stored procedure call, usually written with the JDBC `{call ...}` escape.
    Callable,
}

/// A possibly schema-qualified object name, rendered for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single statement, reduced to the positions that name objects.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlStatement {
    Query(QueryBody),
    Insert {
        table: TableName,
        source: Option<QueryBody>,
    },
    Update {
        table: FromClause,
        subqueries: Vec<QueryBody>,
    },
    Delete {
        /// Explicit multi-table targets (`DELETE t1, t2 FROM ...`).
        targets: Vec<TableName>,
        from: Vec<FromClause>,
        using: Vec<FromClause>,
        subqueries: Vec<QueryBody>,
    },
    Merge {
        target: FromItem,
        source: FromItem,
    },
    Call {
        procedure: TableName,
    },
    /// `EXEC`/`EXECUTE` of a named procedure or prepared statement.
    Execute {
        procedure: TableName,
    },
    /// DDL and utility statements with a fixed operation name.
    Utility {
        operation: String,
        target: Option<TableName>,
    },
    Unknown,
}

/// A query expression together with its common table expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryBody {
    pub body: SetBody,
    pub ctes: Vec<QueryBody>,
}

impl QueryBody {
    pub fn select(select: SelectBody) -> Self {
        Self {
            body: SetBody::Select(Box::new(select)),
            ctes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetBody {
    Select(Box<SelectBody>),
    Nested(Box<QueryBody>),
    SetOperation {
        left: Box<SetBody>,
        right: Box<SetBody>,
    },
    Values,
    Other,
}

/// The parts of a `SELECT` the classifier walks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectBody {
    pub from: Vec<FromClause>,
    /// Subqueries found in the projection, `WHERE` and `HAVING`, in source order.
    pub subqueries: Vec<QueryBody>,
}

/// One item of a `FROM` list along with the relations joined onto it.
#[derive(Debug, Clone, PartialEq)]
pub struct FromClause {
    pub relation: FromItem,
    pub joins: Vec<FromItem>,
}

impl FromClause {
    pub fn table(name: &str) -> Self {
        Self {
            relation: FromItem::Table(TableName::new(name)),
            joins: Vec::new(),
        }
    }

    pub fn with_join(mut self, item: FromItem) -> Self {
        self.joins.push(item);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FromItem {
    Table(TableName),
    Derived(Box<QueryBody>),
    Nested(Box<FromClause>),
    /// Table functions, `UNNEST` and other relations without a name.
    Other,
}

impl FromItem {
    pub fn table(name: &str) -> Self {
        FromItem::Table(TableName::new(name))
    }
}
