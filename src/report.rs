//! Operator-facing summaries for bulk operations.
//!
//! Results carry counts plus a handful of representative messages; the
//! rendering layer shows [`BulkReport::summary`] rather than per-item rows.

use serde::Serialize;

use crate::error::{ErrorSample, LogisticsError};

/// How many messages a summary shows inline.
pub const SAMPLE_LIMIT: usize = 3;

/// Success/skip/error tally with capped samples.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct BulkReport {
    pub success: usize,
    pub skipped: usize,
    pub errors: usize,
    pub error_samples: Vec<ErrorSample>,
    pub skip_samples: Vec<String>,
}

impl BulkReport {
    pub fn record_success(&mut self) {
        self.success += 1;
    }

    pub fn record_skip(&mut self, reference: &str, reason: &str) {
        self.skipped += 1;
        if self.skip_samples.len() < SAMPLE_LIMIT {
            self.skip_samples.push(format!("{reference}: {reason}"));
        }
    }

    pub fn record_error(&mut self, reference: &str, err: &LogisticsError) {
        self.errors += 1;
        if self.error_samples.len() < SAMPLE_LIMIT {
            self.error_samples.push(ErrorSample::new(reference, err));
        }
    }

    pub fn total(&self) -> usize {
        self.success + self.skipped + self.errors
    }

    /// One-paragraph summary, e.g.
    /// `Sent 4 orders, 1 skipped, 2 failed: ORD000003: Validation failed: ...`.
    pub fn summary(&self, verb: &str) -> String {
        let mut out = format!("{verb} {} {}", self.success, plural(self.success, "order"));
        if self.skipped > 0 {
            out.push_str(&format!(", {} skipped", self.skipped));
        }
        if self.errors > 0 {
            let messages: Vec<String> = self
                .error_samples
                .iter()
                .map(|s| format!("{}: {}", s.reference, s.message))
                .collect();
            out.push_str(&format!(
                ", {} failed: {}",
                self.errors,
                join_samples(&messages, self.errors)
            ));
        }
        out
    }
}

/// Join up to [`SAMPLE_LIMIT`] samples and append `...and N more` for the rest
/// of `total`.
pub fn join_samples(samples: &[String], total: usize) -> String {
    let shown = &samples[..samples.len().min(SAMPLE_LIMIT)];
    let mut out = shown.join("; ");
    let hidden = total.saturating_sub(shown.len());
    if hidden > 0 {
        out.push_str(&format!(" ...and {hidden} more"));
    }
    out
}

pub fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        word.to_string()
    } else {
        format!("{word}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_capped_but_counted() {
        let mut report = BulkReport::default();
        report.record_success();
        for n in 1..=5 {
            report.record_error(
                &format!("ORD00000{n}"),
                &LogisticsError::validation("Missing required field: phone"),
            );
        }
        report.record_skip("ORD000009", "already sent");

        assert_eq!(report.errors, 5);
        assert_eq!(report.error_samples.len(), SAMPLE_LIMIT);
        assert_eq!(report.total(), 7);

        let summary = report.summary("Sent");
        assert!(summary.starts_with("Sent 1 order, 1 skipped, 5 failed: ORD000001: "));
        assert!(summary.ends_with("...and 2 more"));
    }

    #[test]
    fn clean_run_has_no_tail() {
        let mut report = BulkReport::default();
        report.record_success();
        report.record_success();
        assert_eq!(report.summary("Synced"), "Synced 2 orders");
    }

    #[test]
    fn join_without_overflow() {
        let samples = vec!["a".to_string(), "b".to_string()];
        assert_eq!(join_samples(&samples, 2), "a; b");
        assert_eq!(join_samples(&samples, 4), "a; b ...and 2 more");
    }
}
