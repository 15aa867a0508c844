//! Configuration for query analysis and tracing behavior.

use std::time::Duration;

/// SQL grammar used when parsing query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SqlDialect {
    #[default]
    Generic,
    PostgreSql,
    MySql,
    MsSql,
    Sqlite,
}

/// Configuration options for the query analyzer.
///
/// # Example
///
/// ```rust
/// use sql_observation::AnalysisConfig;
/// use std::time::Duration;
///
/// let config = AnalysisConfig::default()
///     .with_query_summary_max_length(64)
///     .with_timeout(Duration::from_millis(50));
/// ```
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Maximum length, in characters, of the query summary.
    /// Default: 255
    pub query_summary_max_length: usize,

    /// Whether analysis results are memoized by query text.
    /// Default: `true`
    pub cache_enabled: bool,

    /// Maximum number of memoized query texts.
    /// Default: 1000
    pub cache_capacity: usize,

    /// Upper bound on the time spent analyzing a single query.
    /// When set, each uncached analysis runs on its own helper thread and a
    /// degraded result is returned once the bound elapses. The thread is not
    /// interrupted: it runs to completion and its late result is dropped.
    /// Default: `None`
    pub timeout: Option<Duration>,

    /// Maximum number of helper threads running at once when a timeout is set,
    /// counting threads whose caller already gave up. A query that finds every
    /// slot taken gets an uncached degraded result without spawning a thread.
    /// Default: 4
    pub max_timeout_workers: usize,

    /// Grammar used to parse query text.
    /// Default: [`SqlDialect::Generic`]
    pub dialect: SqlDialect,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            query_summary_max_length: 255,
            cache_enabled: true,
            cache_capacity: 1000,
            timeout: None,
            max_timeout_workers: 4,
            dialect: SqlDialect::Generic,
        }
    }
}

impl AnalysisConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum query summary length.
    pub fn with_query_summary_max_length(mut self, max_length: usize) -> Self {
        self.query_summary_max_length = max_length;
        self
    }

    /// Enable or disable the analysis cache.
    ///
    /// With the cache disabled every call re-parses and re-classifies the text.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Set the number of query texts the cache keeps before evicting.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Bound the time spent analyzing a single query.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many timeout helper threads may run at once.
    pub fn with_max_timeout_workers(mut self, workers: usize) -> Self {
        self.max_timeout_workers = workers;
        self
    }

    /// Set the SQL grammar used for parsing.
    pub fn with_dialect(mut self, dialect: SqlDialect) -> Self {
        self.dialect = dialect;
        self
    }
}

/// Configuration options for [`TracedConnection`](crate::TracedConnection).
///
/// # Example
///
/// ```rust
/// use sql_observation::TracingConfig;
/// use std::time::Duration;
///
/// let config = TracingConfig::default()
///     .with_statement_logging(true)
///     .with_slow_query_threshold(Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to include the sanitized SQL statement in spans.
    /// Default: `false`
    pub log_statements: bool,

    /// Threshold for logging slow queries at WARN level.
    /// Default: 500ms
    pub slow_query_threshold: Duration,

    /// Whether to record the number of rows affected/returned.
    /// Default: `true`
    pub record_row_counts: bool,

    /// Custom database name to include in spans (useful for multi-database setups).
    /// Default: `None`
    pub database_name: Option<String>,

    /// Server address recorded as `server.address`.
    /// Default: `None`
    pub server_address: Option<String>,

    /// Server port recorded as `server.port`.
    /// Default: `None`
    pub server_port: Option<u16>,

    /// Logical service name recorded as `peer.service`.
    /// Default: `None`
    pub peer_service: Option<String>,

    /// Settings for the analyzer that names and tags each span.
    pub analysis: AnalysisConfig,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_statements: false,
            slow_query_threshold: Duration::from_millis(500),
            record_row_counts: true,
            database_name: None,
            server_address: None,
            server_port: None,
            peer_service: None,
            analysis: AnalysisConfig::default(),
        }
    }
}

impl TracingConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable SQL statement logging in spans.
    ///
    /// Only the sanitized statement is recorded for plain statements; prepared
    /// statements are recorded verbatim since their values travel separately.
    pub fn with_statement_logging(mut self, enabled: bool) -> Self {
        self.log_statements = enabled;
        self
    }

    /// Set the threshold for slow query warnings.
    ///
    /// Queries taking longer than this duration will be logged at WARN level
    /// with the `slow_query` field set to `true`.
    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    /// Enable or disable row count recording.
    pub fn with_row_count_recording(mut self, enabled: bool) -> Self {
        self.record_row_counts = enabled;
        self
    }

    /// Set a database name to include in spans.
    pub fn with_database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = Some(name.into());
        self
    }

    /// Set the server address and port to include in spans.
    pub fn with_server(mut self, address: impl Into<String>, port: u16) -> Self {
        self.server_address = Some(address.into());
        self.server_port = Some(port);
        self
    }

    /// Set the `peer.service` name to include in spans.
    pub fn with_peer_service(mut self, service: impl Into<String>) -> Self {
        self.peer_service = Some(service.into());
        self
    }

    /// Replace the analyzer settings.
    pub fn with_analysis(mut self, analysis: AnalysisConfig) -> Self {
        self.analysis = analysis;
        self
    }

    /// Create a development-friendly configuration with full logging enabled.
    pub fn development() -> Self {
        Self {
            log_statements: true,
            slow_query_threshold: Duration::from_millis(100),
            analysis: AnalysisConfig::default().with_cache_capacity(100),
            ..Self::default()
        }
    }

    /// Create a production configuration with a bounded analysis time.
    pub fn production() -> Self {
        Self {
            log_statements: false,
            slow_query_threshold: Duration::from_secs(1),
            analysis: AnalysisConfig::default().with_timeout(Duration::from_millis(100)),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_defaults() {
        let config = AnalysisConfig::default();
        assert_eq!(config.query_summary_max_length, 255);
        assert!(config.cache_enabled);
        assert_eq!(config.cache_capacity, 1000);
        assert!(config.timeout.is_none());
        assert_eq!(config.max_timeout_workers, 4);
        assert_eq!(config.dialect, SqlDialect::Generic);
    }

    #[test]
    fn test_config_builder() {
        let config = TracingConfig::default()
            .with_statement_logging(true)
            .with_database_name("test_db")
            .with_server("db.internal", 5432);

        assert!(config.log_statements);
        assert_eq!(config.database_name, Some("test_db".to_string()));
        assert_eq!(config.server_port, Some(5432));
    }

    #[test]
    fn test_presets() {
        assert!(TracingConfig::development().log_statements);
        let production = TracingConfig::production();
        assert!(!production.log_statements);
        assert_eq!(production.analysis.timeout, Some(Duration::from_millis(100)));
    }
}
