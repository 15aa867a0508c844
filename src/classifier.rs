//! Statement classification: operation name, referenced objects and main target.

use crate::ast::{FromClause, FromItem, QueryBody, SelectBody, SetBody, SqlStatement, TableName};

/// What a [`VisitedEntry`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Operation,
    Collection,
}

/// One token of the classification, in traversal order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VisitedEntry {
    pub kind: EntryKind,
    pub text: String,
}

impl VisitedEntry {
    pub fn operation(text: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Operation,
            text: text.into(),
        }
    }

    pub fn collection(text: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Collection,
            text: text.into(),
        }
    }
}

/// Outcome of classifying one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    pub operation_name: Option<String>,
    /// The single table, view or procedure the statement acts upon, if unambiguous.
    pub main_target_name: Option<String>,
    /// Whether `main_target_name` names a stored procedure.
    pub target_is_procedure: bool,
    pub entries: Vec<VisitedEntry>,
}

#[derive(Debug)]
enum MainTarget {
    Unset,
    /// First table seen; a join or multi-item `FROM` at the same level clears it.
    Candidate(String),
    /// Target of a DML statement or call; never cleared.
    Driving(String),
    Ambiguous,
}

impl MainTarget {
    fn name(self) -> Option<String> {
        match self {
            MainTarget::Candidate(name) | MainTarget::Driving(name) => Some(name),
            MainTarget::Unset | MainTarget::Ambiguous => None,
        }
    }
}

/// Accumulator owned by a single [`classify`] call.
struct Walk {
    entries: Vec<VisitedEntry>,
    /// Number of collection entries pushed so far.
    collections: usize,
    main: MainTarget,
}

impl Walk {
    fn operation(&mut self, name: &str) {
        self.entries.push(VisitedEntry::operation(name));
    }

    fn collection(&mut self, name: &TableName) {
        self.entries.push(VisitedEntry::collection(name.as_str()));
        self.collections += 1;
        if matches!(self.main, MainTarget::Unset) {
            self.main = MainTarget::Candidate(name.to_string());
        }
    }

    fn driving(&mut self, name: &TableName) {
        self.entries.push(VisitedEntry::collection(name.as_str()));
        self.collections += 1;
        if matches!(self.main, MainTarget::Unset | MainTarget::Candidate(_)) {
            self.main = MainTarget::Driving(name.to_string());
        }
    }

    fn is_unset(&self) -> bool {
        matches!(self.main, MainTarget::Unset)
    }

    /// Clears a candidate that was established inside the current level.
    fn ambiguous_since(&mut self, was_unset: bool) {
        if was_unset && matches!(self.main, MainTarget::Unset | MainTarget::Candidate(_)) {
            self.main = MainTarget::Ambiguous;
        }
    }

    /// Drops the last entry when a join repeats the relation before it.
    fn dedupe_join(&mut self) {
        let len = self.entries.len();
        if len >= 2 && self.entries[len - 1] == self.entries[len - 2] {
            self.entries.pop();
        }
    }

    fn query(&mut self, query: &QueryBody) {
        self.set_body(&query.body);
        for cte in &query.ctes {
            self.query(cte);
        }
    }

    fn set_body(&mut self, body: &SetBody) {
        match body {
            SetBody::Select(select) => self.select(select),
            SetBody::Nested(query) => self.query(query),
            // Ambiguous only when both sides name a relation.
            SetBody::SetOperation { left, right } => {
                let was_unset = self.is_unset();
                let before = self.collections;
                self.set_body(left);
                let after_left = self.collections;
                self.set_body(right);
                if after_left > before && self.collections > after_left {
                    self.ambiguous_since(was_unset);
                }
            }
            SetBody::Values | SetBody::Other => {}
        }
    }

    fn select(&mut self, select: &SelectBody) {
        self.operation("SELECT");

        let was_unset = self.is_unset();
        let mut joined = false;
        for clause in &select.from {
            joined |= self.from_clause(clause);
        }
        if joined || select.from.len() > 1 {
            self.ambiguous_since(was_unset);
        }

        for subquery in &select.subqueries {
            self.query(subquery);
        }
    }

    /// Visits a clause and reports whether it joined anything.
    fn from_clause(&mut self, clause: &FromClause) -> bool {
        let mut joined = self.from_item(&clause.relation);
        for join in &clause.joins {
            self.from_item(join);
            self.dedupe_join();
            joined = true;
        }
        joined
    }

    fn from_item(&mut self, item: &FromItem) -> bool {
        match item {
            FromItem::Table(name) => {
                self.collection(name);
                false
            }
            FromItem::Derived(query) => {
                self.query(query);
                false
            }
            FromItem::Nested(clause) => self.from_clause(clause),
            FromItem::Other => false,
        }
    }

    /// Visits the target of a DML statement, then whatever it joins.
    fn target_clause(&mut self, clause: &FromClause) {
        match &clause.relation {
            FromItem::Table(name) => self.driving(name),
            other => {
                self.from_item(other);
            }
        }
        for join in &clause.joins {
            self.from_item(join);
            self.dedupe_join();
        }
    }
}

/// Classify a statement.
///
/// Entries are emitted in traversal order: the statement's operation, its
/// target, then the relations and nested `SELECT`s of its sources. The first
/// table visited becomes the main target unless a join or a multi-item `FROM`
/// list at the same level makes it ambiguous.
pub fn classify(statement: &SqlStatement) -> ClassificationResult {
    let mut walk = Walk {
        entries: Vec::new(),
        collections: 0,
        main: MainTarget::Unset,
    };

    let operation = match statement {
        SqlStatement::Query(query) => {
            walk.query(query);
            "SELECT".to_string()
        }
        SqlStatement::Insert { table, source } => {
            walk.operation("INSERT");
            walk.driving(table);
            if let Some(source) = source {
                walk.query(source);
            }
            "INSERT".to_string()
        }
        SqlStatement::Update { table, subqueries } => {
            walk.operation("UPDATE");
            walk.target_clause(table);
            for subquery in subqueries {
                walk.query(subquery);
            }
            "UPDATE".to_string()
        }
        SqlStatement::Delete {
            targets,
            from,
            using,
            subqueries,
        } => {
            walk.operation("DELETE");
            for target in targets {
                walk.driving(target);
            }
            for clause in from {
                walk.target_clause(clause);
            }
            for clause in using {
                walk.from_clause(clause);
            }
            for subquery in subqueries {
                walk.query(subquery);
            }
            "DELETE".to_string()
        }
        SqlStatement::Merge { target, source } => {
            walk.operation("MERGE");
            match target {
                FromItem::Table(name) => walk.driving(name),
                other => {
                    walk.from_item(other);
                }
            }
            walk.from_item(source);
            "MERGE".to_string()
        }
        SqlStatement::Call { procedure } => {
            walk.operation("CALL");
            walk.driving(procedure);
            "CALL".to_string()
        }
        SqlStatement::Execute { procedure } => {
            walk.operation("EXECUTE");
            walk.driving(procedure);
            "EXECUTE".to_string()
        }
        SqlStatement::Utility { operation, target } => {
            walk.operation(operation);
            if let Some(target) = target {
                walk.driving(target);
            }
            operation.clone()
        }
        SqlStatement::Unknown => {
            walk.operation("UNKNOWN");
            "UNKNOWN".to_string()
        }
    };

    ClassificationResult {
        operation_name: Some(operation),
        main_target_name: walk.main.name(),
        target_is_procedure: matches!(
            statement,
            SqlStatement::Call { .. } | SqlStatement::Execute { .. }
        ),
        entries: walk.entries,
    }
}
