//! Bounded query summaries.

use crate::classifier::VisitedEntry;

/// Folds classification entries into a single summary string.
pub trait SummaryPolicy: Send + Sync {
    fn summarize(&self, entries: &[VisitedEntry]) -> String;
}

/// Joins entry texts with single spaces up to a maximum length.
///
/// Entries are kept whole: the first entry that would push the summary past
/// the limit is dropped along with every entry after it, so the result is
/// always a prefix of the full join. Length is counted in characters.
#[derive(Debug, Clone, Copy)]
pub struct QuerySummaryBuilder {
    max_length: usize,
}

impl Default for QuerySummaryBuilder {
    fn default() -> Self {
        Self { max_length: 255 }
    }
}

impl QuerySummaryBuilder {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl SummaryPolicy for QuerySummaryBuilder {
    fn summarize(&self, entries: &[VisitedEntry]) -> String {
        let mut summary = String::new();
        let mut length = 0;

        for entry in entries {
            let text_length = entry.text.chars().count();
            let separator = usize::from(length > 0);
            if length + separator + text_length > self.max_length {
                break;
            }
            if separator == 1 {
                summary.push(' ');
            }
            summary.push_str(&entry.text);
            length += separator + text_length;
        }

        summary
    }
}
