//! Per-file error report
//!
//! Written as JSON next to the file's terminal path whenever a file has rejected records,
//! failed batches or a fatal error. Rejected records keep source line order.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{FailedBatch, Placement, RecordCounts, RejectedRecord};

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub file: String,
    pub fingerprint: Option<String>,
    pub placement: Placement,
    pub generated_at: DateTime<Utc>,
    pub counts: RecordCounts,
    pub fatal_errors: Vec<String>,
    /// Batches that reached the sink but never committed ("load-failed")
    pub failed_batches: Vec<FailedBatch>,
    pub rejected: Vec<RejectedRecord>,
}

impl ErrorReport {
    pub fn is_empty(&self) -> bool {
        self.rejected.is_empty() && self.failed_batches.is_empty() && self.fatal_errors.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{Violation, ViolationKind};

    #[test]
    fn test_report_serializes_violations_with_kinds() {
        let report = ErrorReport {
            file: "amounts.csv".into(),
            fingerprint: Some("abc123".into()),
            placement: Placement::Archived,
            generated_at: Utc::now(),
            counts: RecordCounts {
                read: 3,
                accepted: 1,
                rejected: 2,
                loaded: 1,
                ..RecordCounts::default()
            },
            fatal_errors: Vec::new(),
            failed_batches: Vec::new(),
            rejected: vec![RejectedRecord {
                line: 3,
                fields: vec!["2".into(), "-5".into()],
                violations: vec![Violation {
                    rule: "range:amt".into(),
                    kind: ViolationKind::RangeCheck,
                    message: "column 'amt' = -5 is below minimum 0".into(),
                }],
            }],
        };
        assert!(!report.is_empty());

        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["placement"], "archived");
        assert_eq!(json["counts"]["rejected"], 2);
        assert_eq!(json["rejected"][0]["line"], 3);
        assert_eq!(json["rejected"][0]["violations"][0]["kind"], "range-check");
    }
}
