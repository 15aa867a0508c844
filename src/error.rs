//! Error types for query analysis.

use std::time::Duration;

use sqlparser::parser::ParserError;
use thiserror::Error;

/// Why a query could not be analyzed.
///
/// None of these reach callers of [`QueryAnalyzer::analyze`](crate::QueryAnalyzer::analyze);
/// they are logged and turned into a degraded result that only keeps the raw text.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The text contains no statement.
    #[error("query text contains no statement")]
    Empty,

    /// The grammar rejected the text.
    #[error("failed to parse query: {0}")]
    Parse(#[from] ParserError),

    /// Analysis did not finish within the configured bound.
    #[error("query analysis did not finish within {0:?}")]
    Timeout(Duration),

    /// The helper thread could not be started or stopped without a result.
    #[error("query analysis worker stopped before producing a result")]
    Worker,

    /// Every helper thread slot is held by a still-running analysis.
    #[error("all {0} query analysis workers are busy")]
    Saturated(usize),
}
