//! Boundary with the SQL grammar.
//!
//! Query text is parsed with `sqlparser` and lowered into the closed model of
//! [`crate::ast`]. Nothing outside this module looks at `sqlparser` statement
//! kinds except the sanitizer, which renders them back to text.

use std::borrow::Cow;
use std::ops::ControlFlow;

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{
    FromTable, ObjectName, Query, SetExpr, Statement, TableFactor, TableWithJoins, Visit, Visitor,
};
use sqlparser::dialect::{
    Dialect, GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect,
};
use sqlparser::parser::Parser;

use crate::ast::{FromClause, FromItem, QueryBody, SelectBody, SetBody, SqlStatement, TableName};
use crate::config::SqlDialect;
use crate::error::AnalysisError;

// `{call proc(?)}`, `{? = call proc(?)}`, `{CALL proc}`
static CALL_ESCAPE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*\{\s*(?:\?\s*=\s*)?call\s+(.*?)\s*\}\s*;?\s*$").unwrap()
});

impl SqlDialect {
    fn grammar(self) -> Box<dyn Dialect> {
        match self {
            SqlDialect::Generic => Box::new(GenericDialect {}),
            SqlDialect::PostgreSql => Box::new(PostgreSqlDialect {}),
            SqlDialect::MySql => Box::new(MySqlDialect {}),
            SqlDialect::MsSql => Box::new(MsSqlDialect {}),
            SqlDialect::Sqlite => Box::new(SQLiteDialect {}),
        }
    }
}

/// Rewrite JDBC call escapes into a plain `CALL` statement.
pub fn normalize_call_escape(sql: &str) -> Cow<'_, str> {
    match CALL_ESCAPE_REGEX.captures(sql).and_then(|caps| caps.get(1)) {
        Some(body) => Cow::Owned(format!("CALL {}", body.as_str())),
        None => Cow::Borrowed(sql),
    }
}

/// The statements of one query text. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStatements(Vec<Statement>);

impl ParsedStatements {
    /// The statement that decides classification.
    pub fn first(&self) -> &Statement {
        &self.0[0]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Statement> {
        self.0.iter()
    }
}

/// Parse query text into one or more statements.
pub fn parse(sql: &str, dialect: SqlDialect) -> Result<ParsedStatements, AnalysisError> {
    let text = normalize_call_escape(sql);
    let statements = Parser::parse_sql(dialect.grammar().as_ref(), &text)?;
    if statements.is_empty() {
        return Err(AnalysisError::Empty);
    }
    Ok(ParsedStatements(statements))
}

/// Render an object name for reporting.
///
/// Parts are joined unquoted (`"public"."users"` becomes `public.users`),
/// except when a quoted part itself carries the qualifier (`` `shop.users` ``),
/// in which case the name is kept exactly as written.
pub fn table_name(name: &ObjectName) -> TableName {
    let quoted_qualifier = name
        .0
        .iter()
        .any(|ident| ident.quote_style.is_some() && ident.value.contains('.'));
    if quoted_qualifier {
        return TableName::new(name.to_string());
    }

    let parts: Vec<&str> = name.0.iter().map(|ident| ident.value.as_str()).collect();
    TableName::new(parts.join("."))
}

fn utility(operation: &str, target: Option<&ObjectName>) -> SqlStatement {
    SqlStatement::Utility {
        operation: operation.to_string(),
        target: target.map(table_name),
    }
}

/// Lower a parsed statement into the classifier's model.
pub fn lower(statement: &Statement) -> SqlStatement {
    match statement {
        Statement::Query(query) => SqlStatement::Query(lower_query(query)),
        Statement::Insert(insert) => SqlStatement::Insert {
            table: table_name(&insert.table_name),
            source: insert.source.as_deref().map(lower_query),
        },
        Statement::Update {
            table, selection, ..
        } => SqlStatement::Update {
            table: lower_clause(table),
            subqueries: subqueries_in(selection),
        },
        Statement::Delete(delete) => {
            let from = match &delete.from {
                FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
            };
            SqlStatement::Delete {
                targets: delete.tables.iter().map(table_name).collect(),
                from: from.iter().map(lower_clause).collect(),
                using: delete.using.iter().flatten().map(lower_clause).collect(),
                subqueries: subqueries_in(&delete.selection),
            }
        }
        Statement::Merge { table, source, .. } => SqlStatement::Merge {
            target: lower_factor(table),
            source: lower_factor(source),
        },
        Statement::Call(function) => SqlStatement::Call {
            procedure: table_name(&function.name),
        },
        Statement::Execute { name, .. } => SqlStatement::Execute {
            procedure: table_name(name),
        },

        Statement::CreateTable(create) => utility("CREATE TABLE", Some(&create.name)),
        Statement::CreateView {
            name, materialized, ..
        } => {
            let operation = if *materialized {
                "CREATE MATERIALIZED VIEW"
            } else {
                "CREATE VIEW"
            };
            utility(operation, Some(name))
        }
        Statement::CreateIndex(index) => utility("CREATE INDEX", Some(&index.table_name)),
        Statement::CreateDatabase { db_name, .. } => utility("CREATE DATABASE", Some(db_name)),
        Statement::CreateSequence { name, .. } => utility("CREATE SEQUENCE", Some(name)),
        Statement::CreateProcedure { name, .. } => utility("CREATE PROCEDURE", Some(name)),
        Statement::CreateType { name, .. } => utility("CREATE TYPE", Some(name)),
        Statement::CreateSchema { .. } => utility("CREATE SCHEMA", None),
        Statement::CreateFunction { .. } => utility("CREATE FUNCTION", None),
        Statement::CreateTrigger { .. } => utility("CREATE TRIGGER", None),
        Statement::CreateRole { .. } => utility("CREATE ROLE", None),
        Statement::CreateExtension { .. } => utility("CREATE EXTENSION", None),
        Statement::AlterTable { name, .. } => utility("ALTER TABLE", Some(name)),
        Statement::AlterView { name, .. } => utility("ALTER VIEW", Some(name)),
        Statement::AlterIndex { .. } => utility("ALTER INDEX", None),
        Statement::AlterRole { .. } => utility("ALTER ROLE", None),
        Statement::Drop {
            object_type, names, ..
        } => SqlStatement::Utility {
            operation: format!("DROP {object_type}"),
            target: names.first().map(table_name),
        },
        Statement::DropFunction { .. } => utility("DROP FUNCTION", None),
        Statement::DropProcedure { .. } => utility("DROP PROCEDURE", None),
        Statement::Truncate { table_names, .. } => {
            utility("TRUNCATE", table_names.first().map(|target| &target.name))
        }
        Statement::Analyze { table_name, .. } => utility("ANALYZE", Some(table_name)),
        Statement::Msck { table_name, .. } => utility("MSCK", Some(table_name)),
        Statement::Grant { .. } => utility("GRANT", None),
        Statement::Revoke { .. } => utility("REVOKE", None),
        Statement::StartTransaction { .. } => utility("START TRANSACTION", None),
        Statement::Commit { .. } => utility("COMMIT", None),
        Statement::Rollback { .. } => utility("ROLLBACK", None),
        Statement::Savepoint { .. } => utility("SAVEPOINT", None),
        Statement::ReleaseSavepoint { .. } => utility("RELEASE SAVEPOINT", None),
        Statement::SetVariable { .. } => utility("SET", None),
        Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. } => utility("SHOW", None),
        Statement::Use { .. } => utility("USE", None),
        Statement::Explain { .. } | Statement::ExplainTable { .. } => utility("EXPLAIN", None),
        Statement::Copy { .. } => utility("COPY", None),
        Statement::Comment { .. } => utility("COMMENT", None),
        Statement::Declare { .. } => utility("DECLARE", None),
        Statement::Prepare { .. } => utility("PREPARE", None),
        Statement::Deallocate { .. } => utility("DEALLOCATE", None),
        Statement::Fetch { .. } => utility("FETCH", None),
        Statement::Close { .. } => utility("CLOSE", None),
        Statement::LockTables { .. } => utility("LOCK TABLES", None),
        Statement::UnlockTables { .. } => utility("UNLOCK TABLES", None),
        Statement::Kill { .. } => utility("KILL", None),
        Statement::Discard { .. } => utility("DISCARD", None),
        Statement::Pragma { .. } => utility("PRAGMA", None),
        _ => SqlStatement::Unknown,
    }
}

fn lower_query(query: &Query) -> QueryBody {
    QueryBody {
        body: lower_set(&query.body),
        ctes: query
            .with
            .iter()
            .flat_map(|with| &with.cte_tables)
            .map(|cte| lower_query(&cte.query))
            .collect(),
    }
}

fn lower_set(set: &SetExpr) -> SetBody {
    match set {
        SetExpr::Select(select) => {
            let mut subqueries = subqueries_in(&select.projection);
            subqueries.extend(subqueries_in(&select.selection));
            subqueries.extend(subqueries_in(&select.having));
            SetBody::Select(Box::new(SelectBody {
                from: select.from.iter().map(lower_clause).collect(),
                subqueries,
            }))
        }
        SetExpr::Query(query) => SetBody::Nested(Box::new(lower_query(query))),
        SetExpr::SetOperation { left, right, .. } => SetBody::SetOperation {
            left: Box::new(lower_set(left)),
            right: Box::new(lower_set(right)),
        },
        SetExpr::Values(_) => SetBody::Values,
        _ => SetBody::Other,
    }
}

fn lower_clause(clause: &TableWithJoins) -> FromClause {
    FromClause {
        relation: lower_factor(&clause.relation),
        joins: clause
            .joins
            .iter()
            .map(|join| lower_factor(&join.relation))
            .collect(),
    }
}

fn lower_factor(factor: &TableFactor) -> FromItem {
    match factor {
        TableFactor::Table { name, .. } => FromItem::Table(table_name(name)),
        TableFactor::Derived { subquery, .. } => FromItem::Derived(Box::new(lower_query(subquery))),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => FromItem::Nested(Box::new(lower_clause(table_with_joins))),
        _ => FromItem::Other,
    }
}

/// Collects the outermost subqueries of an expression tree.
struct SubqueryCollector {
    depth: usize,
    found: Vec<QueryBody>,
}

impl Visitor for SubqueryCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if self.depth == 0 {
            self.found.push(lower_query(query));
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }
}

fn subqueries_in<V: Visit>(node: &V) -> Vec<QueryBody> {
    let mut collector = SubqueryCollector {
        depth: 0,
        found: Vec::new(),
    };
    let _ = node.visit(&mut collector);
    collector.found
}
