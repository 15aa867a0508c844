//! Literal masking for plain statements.

use std::convert::Infallible;
use std::ops::ControlFlow;

use sqlparser::ast::{Expr, Statement, UnaryOperator, Value, VisitMut, VisitorMut};

const MASK: &str = "?";

use crate::config::SqlDialect;
use crate::error::AnalysisError;
use crate::parser;

/// Rendering of a parsed statement as literal-free text.
pub trait SanitizePolicy: Send + Sync {
    fn sanitize(&self, statement: &Statement) -> String;
}

/// Replaces every literal constant with `?`.
///
/// Numeric, string, boolean, date/time, hex, charset-introduced and `NULL`
/// literals are masked. A `+`, `-` or `~` sign in front of a literal is dropped
/// with it. Positional markers already in the text (`?`, `$1`, `:name`) are kept
/// as written.
///
/// Literals the grammar keeps as raw strings rather than expressions, the
/// `ESCAPE` character of a pattern match and the text of a `COMMENT ON`, are
/// rendered as `'?'` since the grammar always quotes them.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuerySanitizer;

impl QuerySanitizer {
    pub fn new() -> Self {
        Self
    }

    /// Parse and sanitize query text in one step.
    pub fn sanitize_sql(&self, sql: &str, dialect: SqlDialect) -> Result<String, AnalysisError> {
        let statements = parser::parse(sql, dialect)?;
        Ok(statements
            .iter()
            .map(|statement| self.sanitize(statement))
            .collect::<Vec<_>>()
            .join("; "))
    }
}

impl SanitizePolicy for QuerySanitizer {
    fn sanitize(&self, statement: &Statement) -> String {
        let mut statement = statement.clone();
        let _ = statement.visit(&mut LiteralMask);
        statement.to_string()
    }
}

struct LiteralMask;

impl VisitorMut for LiteralMask {
    type Break = Infallible;

    fn pre_visit_statement(&mut self, statement: &mut Statement) -> ControlFlow<Self::Break> {
        if let Statement::Comment {
            comment: Some(comment),
            ..
        } = statement
        {
            *comment = MASK.to_string();
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        if is_literal(expr) {
            *expr = Expr::Value(Value::Placeholder(MASK.to_string()));
            return ControlFlow::Continue(());
        }

        if let Expr::Like {
            escape_char: Some(escape),
            ..
        }
        | Expr::ILike {
            escape_char: Some(escape),
            ..
        }
        | Expr::SimilarTo {
            escape_char: Some(escape),
            ..
        } = expr
        {
            *escape = MASK.to_string();
        }
        ControlFlow::Continue(())
    }
}

fn is_literal(expr: &Expr) -> bool {
    match expr {
        Expr::Value(Value::Placeholder(_)) => false,
        Expr::Value(_) | Expr::TypedString { .. } | Expr::IntroducedString { .. } => true,
        Expr::UnaryOp {
            op: UnaryOperator::Plus | UnaryOperator::Minus | UnaryOperator::PGBitwiseNot,
            expr,
        } => is_literal(expr),
        _ => false,
    }
}
