//! Query analysis entry point.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::ast::StatementKind;
use crate::cache::AnalysisCache;
use crate::classifier::{classify, ClassificationResult};
use crate::config::{AnalysisConfig, SqlDialect};
use crate::error::AnalysisError;
use crate::parser;
use crate::sanitizer::{QuerySanitizer, SanitizePolicy};
use crate::summary::{QuerySummaryBuilder, SummaryPolicy};

/// Everything the instrumentation layer needs to tag a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzedQuery {
    operation_name: Option<String>,
    collection_name: Option<String>,
    stored_procedure_name: Option<String>,
    query_summary: Option<String>,
    sanitized_text: String,
}

impl AnalyzedQuery {
    /// Result for text that could not be analyzed: the raw text and nothing else.
    pub fn degraded(text: &str) -> Self {
        Self {
            operation_name: None,
            collection_name: None,
            stored_procedure_name: None,
            query_summary: None,
            sanitized_text: text.to_string(),
        }
    }

    fn from_classification(
        classification: ClassificationResult,
        summary: String,
        sanitized_text: String,
        is_batch: bool,
    ) -> Self {
        let (collection_name, stored_procedure_name) = if classification.target_is_procedure {
            (None, classification.main_target_name)
        } else {
            (classification.main_target_name, None)
        };
        let operation_name = classification.operation_name.map(|operation| {
            if is_batch {
                format!("BATCH {operation}")
            } else {
                operation
            }
        });

        Self {
            operation_name,
            collection_name,
            stored_procedure_name,
            query_summary: (!summary.is_empty()).then_some(summary),
            sanitized_text,
        }
    }

    pub fn operation_name(&self) -> Option<&str> {
        self.operation_name.as_deref()
    }

    pub fn collection_name(&self) -> Option<&str> {
        self.collection_name.as_deref()
    }

    pub fn stored_procedure_name(&self) -> Option<&str> {
        self.stored_procedure_name.as_deref()
    }

    pub fn query_summary(&self) -> Option<&str> {
        self.query_summary.as_deref()
    }

    pub fn sanitized_text(&self) -> &str {
        &self.sanitized_text
    }

    pub fn is_degraded(&self) -> bool {
        self.operation_name.is_none()
    }
}

/// The parse → classify → summarize → sanitize chain, cheap to clone onto a
/// helper thread.
#[derive(Clone)]
struct Pipeline {
    dialect: SqlDialect,
    summary: Arc<dyn SummaryPolicy>,
    sanitizer: Arc<dyn SanitizePolicy>,
}

impl Pipeline {
    fn run(
        &self,
        text: &str,
        kind: StatementKind,
        is_batch: bool,
    ) -> Result<AnalyzedQuery, AnalysisError> {
        let statements = parser::parse(text, self.dialect)?;
        let classification = classify(&parser::lower(statements.first()));
        let summary = self.summary.summarize(&classification.entries);

        // Prepared and callable texts already carry placeholders.
        let sanitized_text = match kind {
            StatementKind::Plain => statements
                .iter()
                .map(|statement| self.sanitizer.sanitize(statement))
                .collect::<Vec<_>>()
                .join("; "),
            StatementKind::Prepared | StatementKind::Callable => text.to_string(),
        };

        Ok(AnalyzedQuery::from_classification(
            classification,
            summary,
            sanitized_text,
            is_batch,
        ))
    }

    fn run_with_timeout(
        &self,
        text: &str,
        kind: StatementKind,
        is_batch: bool,
        guard: &TimeoutGuard,
    ) -> Result<AnalyzedQuery, AnalysisError> {
        let permit = WorkerPermit::acquire(&guard.in_flight, guard.max_workers)
            .ok_or(AnalysisError::Saturated(guard.max_workers))?;
        let (sender, receiver) = mpsc::sync_channel(1);
        let pipeline = self.clone();
        let owned_text = text.to_string();

        thread::Builder::new()
            .name("sql-analysis".to_string())
            .spawn(move || {
                let _permit = permit;
                let _ = sender.send(pipeline.run(&owned_text, kind, is_batch));
            })
            .map_err(|_| AnalysisError::Worker)?;

        match receiver.recv_timeout(guard.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(AnalysisError::Timeout(guard.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(AnalysisError::Worker),
        }
    }
}

/// Time bound for analyses, and the helper threads still running them.
///
/// A thread that outlives its timeout keeps its slot until it finishes.
struct TimeoutGuard {
    timeout: Duration,
    max_workers: usize,
    in_flight: Arc<AtomicUsize>,
}

/// One of the `max_workers` slots, released when the helper thread ends.
struct WorkerPermit(Arc<AtomicUsize>);

impl WorkerPermit {
    fn acquire(in_flight: &Arc<AtomicUsize>, max_workers: usize) -> Option<Self> {
        in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
                (running < max_workers).then_some(running + 1)
            })
            .ok()?;
        Some(Self(Arc::clone(in_flight)))
    }
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Analyzes query text into an [`AnalyzedQuery`], memoizing by text.
///
/// # Example
///
/// ```rust
/// use sql_observation::{AnalysisConfig, QueryAnalyzer, StatementKind};
///
/// let analyzer = QueryAnalyzer::new(AnalysisConfig::default());
/// let analyzed = analyzer.analyze("SELECT * FROM emp WHERE id = 7", StatementKind::Plain, false);
///
/// assert_eq!(analyzed.operation_name(), Some("SELECT"));
/// assert_eq!(analyzed.collection_name(), Some("emp"));
/// assert_eq!(analyzed.query_summary(), Some("SELECT emp"));
/// assert_eq!(analyzed.sanitized_text(), "SELECT * FROM emp WHERE id = ?");
/// ```
pub struct QueryAnalyzer {
    pipeline: Pipeline,
    cache: Option<AnalysisCache>,
    timeout: Option<TimeoutGuard>,
}

impl QueryAnalyzer {
    /// Create an analyzer with the default summary and sanitizer strategies.
    pub fn new(config: AnalysisConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: AnalysisConfig) -> QueryAnalyzerBuilder {
        QueryAnalyzerBuilder {
            summary: None,
            sanitizer: None,
            config,
        }
    }

    /// Analyze query text.
    ///
    /// Never fails: text that cannot be parsed, whose analysis exceeds the
    /// configured timeout, or that finds every helper thread busy yields
    /// [`AnalyzedQuery::degraded`]. Only the last case is left out of the cache.
    pub fn analyze(&self, text: &str, kind: StatementKind, is_batch: bool) -> Arc<AnalyzedQuery> {
        let analyzed = match &self.cache {
            // The key ignores `kind` and `is_batch`.
            Some(cache) => cache.try_get_or_compute(text, || self.compute(text, kind, is_batch)),
            None => self.compute(text, kind, is_batch).map(Arc::new),
        };

        analyzed.unwrap_or_else(|error| {
            tracing::warn!(error = %error, "Query analysis skipped");
            Arc::new(AnalyzedQuery::degraded(text))
        })
    }

    fn compute(
        &self,
        text: &str,
        kind: StatementKind,
        is_batch: bool,
    ) -> Result<AnalyzedQuery, AnalysisError> {
        let result = match &self.timeout {
            Some(guard) => self.pipeline.run_with_timeout(text, kind, is_batch, guard),
            None => self.pipeline.run(text, kind, is_batch),
        };

        match result {
            Ok(analyzed) => Ok(analyzed),
            Err(error @ AnalysisError::Saturated(_)) => Err(error),
            Err(error @ (AnalysisError::Timeout(_) | AnalysisError::Worker)) => {
                tracing::warn!(error = %error, "Query analysis abandoned");
                Ok(AnalyzedQuery::degraded(text))
            }
            Err(error) => {
                tracing::debug!(error = %error, "Query could not be analyzed");
                Ok(AnalyzedQuery::degraded(text))
            }
        }
    }

    /// Helper threads still running an analysis, including ones whose caller
    /// already gave up waiting.
    pub fn workers_in_flight(&self) -> usize {
        self.timeout
            .as_ref()
            .map_or(0, |guard| guard.in_flight.load(Ordering::Acquire))
    }

    /// The cache, when enabled.
    pub fn cache(&self) -> Option<&AnalysisCache> {
        self.cache.as_ref()
    }
}

impl std::fmt::Debug for QueryAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryAnalyzer")
            .field("dialect", &self.pipeline.dialect)
            .field("cache", &self.cache)
            .field("timeout", &self.timeout.as_ref().map(|guard| guard.timeout))
            .finish()
    }
}

/// Builder for [`QueryAnalyzer`] with pluggable strategies.
pub struct QueryAnalyzerBuilder {
    config: AnalysisConfig,
    summary: Option<Arc<dyn SummaryPolicy>>,
    sanitizer: Option<Arc<dyn SanitizePolicy>>,
}

impl QueryAnalyzerBuilder {
    /// Use a custom summary strategy instead of [`QuerySummaryBuilder`].
    pub fn summary_policy(mut self, policy: impl SummaryPolicy + 'static) -> Self {
        self.summary = Some(Arc::new(policy));
        self
    }

    /// Use a custom sanitizer instead of [`QuerySanitizer`].
    pub fn sanitize_policy(mut self, policy: impl SanitizePolicy + 'static) -> Self {
        self.sanitizer = Some(Arc::new(policy));
        self
    }

    pub fn build(self) -> QueryAnalyzer {
        let summary = self.summary.unwrap_or_else(|| {
            Arc::new(QuerySummaryBuilder::new(self.config.query_summary_max_length))
        });
        let sanitizer = self
            .sanitizer
            .unwrap_or_else(|| Arc::new(QuerySanitizer::new()));

        QueryAnalyzer {
            pipeline: Pipeline {
                dialect: self.config.dialect,
                summary,
                sanitizer,
            },
            cache: self
                .config
                .cache_enabled
                .then(|| AnalysisCache::new(self.config.cache_capacity)),
            timeout: self.config.timeout.map(|timeout| TimeoutGuard {
                timeout,
                max_workers: self.config.max_timeout_workers,
                in_flight: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use sqlparser::ast::Statement;

    use super::*;
    use crate::classifier::VisitedEntry;

    fn analyzer() -> QueryAnalyzer {
        QueryAnalyzer::new(AnalysisConfig::default())
    }

    #[test]
    fn test_analyze_select() {
        let analyzed = analyzer().analyze("SELECT * FROM emp", StatementKind::Plain, false);
        assert_eq!(analyzed.operation_name(), Some("SELECT"));
        assert_eq!(analyzed.collection_name(), Some("emp"));
        assert_eq!(analyzed.stored_procedure_name(), None);
        assert_eq!(analyzed.query_summary(), Some("SELECT emp"));
        assert_eq!(analyzed.sanitized_text(), "SELECT * FROM emp");
    }

    #[test]
    fn test_analyze_call() {
        let analyzed = analyzer().analyze("{CALL foo()}", StatementKind::Callable, false);
        assert_eq!(analyzed.operation_name(), Some("CALL"));
        assert_eq!(analyzed.stored_procedure_name(), Some("foo"));
        assert_eq!(analyzed.collection_name(), None);
        assert_eq!(analyzed.query_summary(), Some("CALL foo"));
        assert_eq!(analyzed.sanitized_text(), "{CALL foo()}");
    }

    #[test]
    fn test_analyze_join_has_no_collection() {
        let analyzed = analyzer().analyze(
            "SELECT * FROM a JOIN b ON a.id=b.id",
            StatementKind::Plain,
            false,
        );
        assert_eq!(analyzed.collection_name(), None);
        assert_eq!(analyzed.query_summary(), Some("SELECT a b"));
    }

    #[test]
    fn test_plain_statements_are_sanitized() {
        let analyzed = analyzer().analyze(
            "SELECT * FROM t WHERE x = 123",
            StatementKind::Plain,
            false,
        );
        assert_eq!(analyzed.sanitized_text(), "SELECT * FROM t WHERE x = ?");
    }

    #[test]
    fn test_prepared_statements_are_kept_verbatim() {
        let sql = "select * from t where x = ? and y = 5";
        let analyzed = analyzer().analyze(sql, StatementKind::Prepared, false);
        assert_eq!(analyzed.sanitized_text(), sql);
        assert_eq!(analyzed.collection_name(), Some("t"));
    }

    #[test]
    fn test_batch_prefixes_operation() {
        let analyzed = analyzer().analyze(
            "INSERT INTO audit (msg) VALUES ('a')",
            StatementKind::Plain,
            true,
        );
        assert_eq!(analyzed.operation_name(), Some("BATCH INSERT"));
        assert_eq!(analyzed.query_summary(), Some("INSERT audit"));
    }

    #[test]
    fn test_unparseable_text_is_degraded() {
        let analyzed = analyzer().analyze("this is not sql 'secret'", StatementKind::Plain, false);
        assert!(analyzed.is_degraded());
        assert_eq!(analyzed.sanitized_text(), "this is not sql 'secret'");
        assert_eq!(analyzed.query_summary(), None);
    }

    #[test]
    fn test_summary_respects_configured_length() {
        let analyzer =
            QueryAnalyzer::new(AnalysisConfig::default().with_query_summary_max_length(10));
        let analyzed = analyzer.analyze(
            "SELECT * FROM orders WHERE id IN (SELECT order_id FROM items)",
            StatementKind::Plain,
            false,
        );
        assert_eq!(analyzed.query_summary(), Some("SELECT"));
    }

    struct CountingSanitizer(Arc<AtomicUsize>);

    impl SanitizePolicy for CountingSanitizer {
        fn sanitize(&self, statement: &Statement) -> String {
            self.0.fetch_add(1, Ordering::SeqCst);
            QuerySanitizer.sanitize(statement)
        }
    }

    #[test]
    fn test_cache_ignores_kind_and_batch_flag() {
        let calls = Arc::new(AtomicUsize::new(0));
        let analyzer = QueryAnalyzer::builder(AnalysisConfig::default())
            .sanitize_policy(CountingSanitizer(Arc::clone(&calls)))
            .build();

        let first = analyzer.analyze("SELECT * FROM t WHERE a = 1", StatementKind::Plain, false);
        let second = analyzer.analyze("SELECT * FROM t WHERE a = 1", StatementKind::Prepared, true);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The second call gets the plain, non-batch result.
        assert_eq!(second.operation_name(), Some("SELECT"));
        assert_eq!(second.sanitized_text(), "SELECT * FROM t WHERE a = ?");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_disabled_cache_recomputes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let analyzer = QueryAnalyzer::builder(AnalysisConfig::default().with_cache(false))
            .sanitize_policy(CountingSanitizer(Arc::clone(&calls)))
            .build();

        analyzer.analyze("SELECT 1", StatementKind::Plain, false);
        analyzer.analyze("SELECT 1", StatementKind::Plain, false);

        assert!(analyzer.cache().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    struct UppercaseSummary;

    impl SummaryPolicy for UppercaseSummary {
        fn summarize(&self, entries: &[VisitedEntry]) -> String {
            entries
                .iter()
                .map(|entry| entry.text.to_uppercase())
                .collect::<Vec<_>>()
                .join("/")
        }
    }

    #[test]
    fn test_custom_summary_policy() {
        let analyzer = QueryAnalyzer::builder(AnalysisConfig::default())
            .summary_policy(UppercaseSummary)
            .build();
        let analyzed = analyzer.analyze("DELETE FROM jobs", StatementKind::Plain, false);
        assert_eq!(analyzed.query_summary(), Some("DELETE/JOBS"));
    }

    struct StallingSanitizer;

    impl SanitizePolicy for StallingSanitizer {
        fn sanitize(&self, _statement: &Statement) -> String {
            thread::sleep(Duration::from_millis(500));
            String::new()
        }
    }

    #[test]
    fn test_timeout_returns_degraded_result() {
        let analyzer = QueryAnalyzer::builder(
            AnalysisConfig::default().with_timeout(Duration::from_millis(20)),
        )
        .sanitize_policy(StallingSanitizer)
        .build();

        let analyzed = analyzer.analyze("SELECT * FROM t WHERE id = 1", StatementKind::Plain, false);
        assert!(analyzed.is_degraded());
        assert_eq!(analyzed.sanitized_text(), "SELECT * FROM t WHERE id = 1");
    }

    struct CountingStall(Arc<AtomicUsize>);

    impl SanitizePolicy for CountingStall {
        fn sanitize(&self, _statement: &Statement) -> String {
            self.0.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(300));
            String::new()
        }
    }

    #[test]
    fn test_busy_workers_are_not_multiplied() {
        let calls = Arc::new(AtomicUsize::new(0));
        let analyzer = QueryAnalyzer::builder(
            AnalysisConfig::default()
                .with_timeout(Duration::from_millis(20))
                .with_max_timeout_workers(1),
        )
        .sanitize_policy(CountingStall(Arc::clone(&calls)))
        .build();

        let stalled = analyzer.analyze("SELECT * FROM a WHERE id = 1", StatementKind::Plain, false);
        assert!(stalled.is_degraded());
        assert_eq!(analyzer.workers_in_flight(), 1);

        // The only slot is taken, so these are turned away without a new thread.
        for id in 2..10 {
            let sql = format!("SELECT * FROM b WHERE id = {id}");
            let analyzed = analyzer.analyze(&sql, StatementKind::Plain, false);
            assert!(analyzed.is_degraded());
            assert_eq!(analyzed.sanitized_text(), sql);
        }
        assert_eq!(analyzer.workers_in_flight(), 1);
        assert!(calls.load(Ordering::SeqCst) <= 1);

        // Timed-out results are cached, turned-away ones are not.
        let cache = analyzer.cache().unwrap();
        assert!(cache.get("SELECT * FROM a WHERE id = 1").is_some());
        assert!(cache.get("SELECT * FROM b WHERE id = 2").is_none());

        // The slot frees up once the stalled thread finishes.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while analyzer.workers_in_flight() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(analyzer.workers_in_flight(), 0);
        analyzer.analyze("SELECT * FROM b WHERE id = 2", StatementKind::Plain, false);
        assert!(cache.get("SELECT * FROM b WHERE id = 2").is_some());
    }

    #[test]
    fn test_analyze_exec() {
        let analyzer = QueryAnalyzer::new(AnalysisConfig::default().with_dialect(SqlDialect::MsSql));
        let analyzed = analyzer.analyze("EXEC dbo.close_month 1", StatementKind::Callable, false);
        assert_eq!(analyzed.operation_name(), Some("EXECUTE"));
        assert_eq!(analyzed.stored_procedure_name(), Some("dbo.close_month"));
        assert_eq!(analyzed.collection_name(), None);
        assert_eq!(analyzed.query_summary(), Some("EXECUTE dbo.close_month"));
    }

    #[test]
    fn test_timeout_not_reached() {
        let analyzer =
            QueryAnalyzer::new(AnalysisConfig::default().with_timeout(Duration::from_secs(5)));
        let analyzed = analyzer.analyze("SELECT * FROM emp", StatementKind::Plain, false);
        assert_eq!(analyzed.collection_name(), Some("emp"));
    }
}
