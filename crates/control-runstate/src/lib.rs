//! The Run State Machine: pure transition rules with no I/O.
//!
//! This is the single source of truth for "is `(from, to)` a legal
//! transition". `control-db::runs::transition` is the transactional
//! operation that loads a row, asks this module, and persists the result —
//! mirroring the split between an in-memory order state machine and the
//! transactional store that enforces it underneath.

use control_schemas::{FailureReasonCode, RunStatus};

/// Why a requested transition was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// `from` is a terminal state; no further transitions are possible.
    Terminal { from: RunStatus },
    /// `(from, to)` does not appear in the transition table.
    NotAllowed { from: RunStatus, to: RunStatus },
    /// Transition targets `failed` but no failure reason code was supplied.
    MissingFailureCode { to: RunStatus },
    /// Transition targets a non-`failed` state but a failure reason code
    /// was supplied anyway.
    UnexpectedFailureCode { to: RunStatus },
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionError::Terminal { from } => {
                write!(f, "run is in terminal state {from}, no further transitions are possible")
            }
            TransitionError::NotAllowed { from, to } => {
                write!(f, "transition {from} -> {to} is not allowed")
            }
            TransitionError::MissingFailureCode { to } => {
                write!(f, "transition to {to} requires a failure_reason_code")
            }
            TransitionError::UnexpectedFailureCode { to } => {
                write!(f, "transition to {to} must not carry a failure_reason_code")
            }
        }
    }
}

impl std::error::Error for TransitionError {}

/// The allowed destinations from a given state, per the canonical table.
pub fn allowed_targets(from: RunStatus) -> &'static [RunStatus] {
    use RunStatus::*;
    match from {
        Queued => &[Planning, Canceled, Failed, Expired],
        Planning => &[Editing, Canceled, Failed, Expired],
        Editing => &[Testing, Canceled, Failed, Expired],
        Testing => &[PreviewReady, Failed, Canceled, Expired],
        PreviewReady => &[NeedsApproval, Failed, Canceled, Expired],
        NeedsApproval => &[Approved, Failed, Canceled, Expired],
        Approved => &[Merging, Failed, Canceled, Expired],
        Merging => &[Deploying, Failed, Canceled],
        Deploying => &[Merged, Failed, Canceled],
        Merged | Failed | Canceled | Expired => &[],
    }
}

/// Validate a requested transition against the canonical table and the
/// failure-reason-code discipline. Does not touch any store; callers that
/// hold a row lock call this, then persist the result themselves.
pub fn validate_transition(
    from: RunStatus,
    to: RunStatus,
    failure_reason_code: Option<FailureReasonCode>,
) -> Result<(), TransitionError> {
    if from.is_terminal() {
        return Err(TransitionError::Terminal { from });
    }
    if !allowed_targets(from).contains(&to) {
        return Err(TransitionError::NotAllowed { from, to });
    }
    match (to, failure_reason_code) {
        (RunStatus::Failed, None) => Err(TransitionError::MissingFailureCode { to }),
        (RunStatus::Failed, Some(_)) => Ok(()),
        (_, Some(_)) => Err(TransitionError::UnexpectedFailureCode { to }),
        (_, None) => Ok(()),
    }
}

/// `retry(run_id)` may only be requested from `failed` or `expired`.
pub fn can_retry_from(status: RunStatus) -> bool {
    matches!(status, RunStatus::Failed | RunStatus::Expired)
}

/// `cancel(run_id)` is accepted from any non-terminal state.
pub fn can_cancel_from(status: RunStatus) -> bool {
    !status.is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunStatus::*;

    #[test]
    fn queued_allows_planning_cancel_fail_expire() {
        let allowed = allowed_targets(Queued);
        assert!(allowed.contains(&Planning));
        assert!(allowed.contains(&Canceled));
        assert!(allowed.contains(&Failed));
        assert!(allowed.contains(&Expired));
        assert!(!allowed.contains(&Merging));
    }

    #[test]
    fn merging_does_not_allow_expired() {
        assert!(!allowed_targets(Merging).contains(&Expired));
        assert!(allowed_targets(Merging).contains(&Deploying));
    }

    #[test]
    fn terminal_states_allow_nothing() {
        for s in [Merged, Failed, Canceled, Expired] {
            assert!(allowed_targets(s).is_empty());
            assert_eq!(
                validate_transition(s, Queued, None),
                Err(TransitionError::Terminal { from: s })
            );
        }
    }

    #[test]
    fn invalid_jump_is_rejected() {
        let err = validate_transition(Queued, Deploying, None).unwrap_err();
        assert_eq!(
            err,
            TransitionError::NotAllowed {
                from: Queued,
                to: Deploying
            }
        );
    }

    #[test]
    fn failed_requires_a_code() {
        let err = validate_transition(Editing, Failed, None).unwrap_err();
        assert_eq!(err, TransitionError::MissingFailureCode { to: Failed });

        assert!(validate_transition(
            Editing,
            Failed,
            Some(FailureReasonCode::ValidationFailed)
        )
        .is_ok());
    }

    #[test]
    fn non_failed_rejects_a_code() {
        let err =
            validate_transition(Queued, Planning, Some(FailureReasonCode::UnknownError))
                .unwrap_err();
        assert_eq!(err, TransitionError::UnexpectedFailureCode { to: Planning });
    }

    #[test]
    fn retry_only_from_failed_or_expired() {
        assert!(can_retry_from(Failed));
        assert!(can_retry_from(Expired));
        assert!(!can_retry_from(Merged));
        assert!(!can_retry_from(Queued));
    }

    #[test]
    fn cancel_from_any_non_terminal_state() {
        for s in [
            Queued,
            Planning,
            Editing,
            Testing,
            PreviewReady,
            NeedsApproval,
            Approved,
            Merging,
            Deploying,
        ] {
            assert!(can_cancel_from(s));
        }
        for s in [Merged, Failed, Canceled, Expired] {
            assert!(!can_cancel_from(s));
        }
    }
}
