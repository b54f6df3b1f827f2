//! Admission-control wait estimation.
//!
//! The exact weighting function is rig/deployment specific, so it sits behind
//! the [`WaitEstimator`] strategy trait. The contract fixes only the
//! signature, monotonicity (more queued non-terminal experiments never
//! decreases the estimate), and non-negativity — both enforced by
//! [`WaitEstimate`]'s constructor.

use super::store::ExperimentRecord;
use crate::proto::WaitEstimate;

/// Pluggable wait-estimation strategy.
pub trait WaitEstimator: Send + Sync {
    /// Estimate queue position and wait for a prospective submission.
    ///
    /// `outstanding` holds the authority's current non-terminal records;
    /// `priority_hint` is the prospective submission's priority (higher is
    /// treated as ahead of lower-priority queued items).
    fn estimate(&self, outstanding: &[ExperimentRecord], priority_hint: i32) -> WaitEstimate;
}

/// Default strategy: running experiments always count; queued experiments
/// count only when their priority is at least the caller's hint.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuntimeSumEstimator;

impl WaitEstimator for RuntimeSumEstimator {
    fn estimate(&self, outstanding: &[ExperimentRecord], priority_hint: i32) -> WaitEstimate {
        let mut queue_length = 0;
        let mut wait = 0.0;
        for record in outstanding {
            let ahead = match record.status {
                crate::proto::StatusCode::Running => true,
                crate::proto::StatusCode::Queued => record.priority_hint >= priority_hint,
                _ => false,
            };
            if ahead {
                queue_length += 1;
                wait += record.estimated_runtime.max(0.0);
            }
        }
        WaitEstimate::new(queue_length, wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::StatusCode;
    use chrono::Utc;

    fn record(id: i32, status: StatusCode, priority: i32, runtime: f64) -> ExperimentRecord {
        ExperimentRecord {
            experiment_id: id,
            lab_server_guid: "lab-1".to_string(),
            execution_id: None,
            status,
            estimated_runtime: runtime,
            min_time_to_live: 14.0,
            submitted_at: Utc::now(),
            user_group: "students".to_string(),
            priority_hint: priority,
            cancel_requested: false,
            result: None,
        }
    }

    #[test]
    fn test_empty_queue() {
        let estimate = RuntimeSumEstimator.estimate(&[], 0);
        assert_eq!(estimate.effective_queue_length, 0);
        assert_eq!(estimate.estimated_wait, 0.0);
    }

    #[test]
    fn test_monotonic_in_queue_content() {
        let mut outstanding = vec![record(1, StatusCode::Queued, 0, 60.0)];
        let before = RuntimeSumEstimator.estimate(&outstanding, 0);
        outstanding.push(record(2, StatusCode::Running, 0, 120.0));
        let after = RuntimeSumEstimator.estimate(&outstanding, 0);
        assert!(after.effective_queue_length >= before.effective_queue_length);
        assert!(after.estimated_wait >= before.estimated_wait);
    }

    #[test]
    fn test_priority_hint_skips_lower_priority_queued() {
        let outstanding = vec![
            record(1, StatusCode::Queued, 0, 60.0),
            record(2, StatusCode::Queued, 5, 60.0),
            record(3, StatusCode::Running, 0, 30.0),
        ];
        // A high-priority caller jumps the low-priority queued item but never
        // the running one.
        let estimate = RuntimeSumEstimator.estimate(&outstanding, 3);
        assert_eq!(estimate.effective_queue_length, 2);
        assert_eq!(estimate.estimated_wait, 90.0);
    }

    #[test]
    fn test_terminal_records_never_count() {
        let outstanding = vec![
            record(1, StatusCode::Completed, 0, 60.0),
            record(2, StatusCode::Cancelled, 0, 60.0),
        ];
        let estimate = RuntimeSumEstimator.estimate(&outstanding, 0);
        assert_eq!(estimate.effective_queue_length, 0);
    }
}
