//! Job-state aggregation (C6, §4.6): after any `TargetOutcome` update,
//! recompute the owning job's state from the set of outcomes.

use forker_protocol::{CopyState, JobState, TargetOutcome};

/// True if `outcome` is either terminal-failed in a way that carries an
/// integrity cause. Callers pass this in rather than re-classifying, since
/// only the worker/orchestrator that persisted the failure knows why.
pub struct AggregationInput<'a> {
    pub outcomes: &'a [TargetOutcome],
    pub max_attempts: u32,
    /// Target ids whose terminal `FailedPermanent` was caused by an
    /// integrity mismatch rather than exhausted retries or a permanent I/O
    /// error.
    pub integrity_failed: &'a [forker_ids::TargetId],
}

/// Recompute the job's state from its targets' current copy states, per the
/// aggregation rules in §4.6. `outcomes` must cover every required target.
pub fn aggregate_job_state(input: &AggregationInput<'_>) -> JobState {
    let outcomes = input.outcomes;

    let any_integrity_failure = outcomes.iter().any(|o| {
        o.copy_state == CopyState::FailedPermanent && input.integrity_failed.contains(&o.target_id)
    });
    if any_integrity_failure {
        return JobState::Quarantined;
    }

    let all_verified = outcomes.iter().all(|o| o.copy_state == CopyState::Verified);
    if all_verified {
        return JobState::Verified;
    }

    let any_verified = outcomes.iter().any(|o| o.copy_state == CopyState::Verified);
    let any_in_flight = outcomes.iter().any(|o| match o.copy_state {
        CopyState::Pending | CopyState::Copying | CopyState::Copied | CopyState::Verifying => true,
        CopyState::FailedRetryable => o.attempts < input.max_attempts,
        CopyState::Verified | CopyState::FailedPermanent => false,
    });

    if any_verified && any_in_flight {
        return JobState::Partial;
    }

    let any_permanent_failure = outcomes.iter().any(|o| o.copy_state == CopyState::FailedPermanent);
    let all_terminal = outcomes
        .iter()
        .all(|o| matches!(o.copy_state, CopyState::Verified | CopyState::FailedPermanent));

    if any_permanent_failure && all_terminal {
        return JobState::Failed;
    }

    JobState::InProgress
}

#[cfg(test)]
mod tests {
    use super::*;
    use forker_ids::{JobId, TargetId};

    fn outcome(target: &str, state: CopyState, attempts: u32) -> TargetOutcome {
        let mut o = TargetOutcome::new(JobId::new(), TargetId::parse(target).unwrap());
        o.copy_state = state;
        o.attempts = attempts;
        o
    }

    fn input<'a>(
        outcomes: &'a [TargetOutcome],
        max_attempts: u32,
        integrity_failed: &'a [TargetId],
    ) -> AggregationInput<'a> {
        AggregationInput {
            outcomes,
            max_attempts,
            integrity_failed,
        }
    }

    #[test]
    fn all_verified_is_verified() {
        let outcomes = vec![
            outcome("TargetA", CopyState::Verified, 1),
            outcome("TargetB", CopyState::Verified, 1),
        ];
        assert_eq!(
            aggregate_job_state(&input(&outcomes, 5, &[])),
            JobState::Verified
        );
    }

    #[test]
    fn one_verified_one_in_flight_is_partial() {
        let outcomes = vec![
            outcome("TargetA", CopyState::Verified, 1),
            outcome("TargetB", CopyState::Copying, 1),
        ];
        assert_eq!(
            aggregate_job_state(&input(&outcomes, 5, &[])),
            JobState::Partial
        );
    }

    #[test]
    fn integrity_failure_dominates_even_with_other_verified() {
        let outcomes = vec![
            outcome("TargetA", CopyState::Verified, 1),
            outcome("TargetB", CopyState::FailedPermanent, 1),
        ];
        let integrity_failed = vec![TargetId::parse("TargetB").unwrap()];
        assert_eq!(
            aggregate_job_state(&input(&outcomes, 5, &integrity_failed)),
            JobState::Quarantined
        );
    }

    #[test]
    fn permanent_failure_without_integrity_is_failed() {
        let outcomes = vec![
            outcome("TargetA", CopyState::Verified, 1),
            outcome("TargetB", CopyState::FailedPermanent, 5),
        ];
        assert_eq!(
            aggregate_job_state(&input(&outcomes, 5, &[])),
            JobState::Failed
        );
    }

    #[test]
    fn retryable_below_max_attempts_is_in_progress() {
        let outcomes = vec![
            outcome("TargetA", CopyState::FailedRetryable, 2),
            outcome("TargetB", CopyState::Copying, 1),
        ];
        assert_eq!(
            aggregate_job_state(&input(&outcomes, 5, &[])),
            JobState::InProgress
        );
    }
}
