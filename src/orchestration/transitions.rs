//! Pure decision logic behind the scan and transition routines.
//!
//! Everything here is side-effect free so the invariants (aggregation
//! verdicts, sequential ordinal choice, dispatch dedup, heartbeat probing)
//! can be exercised without a database.

use chrono::Duration;

use crate::models::{ReplyTimes, Status};

/// Bottom-up aggregation verdict over a parent's child statuses.
///
/// Any errored child dominates; a non-empty, all-finished set finishes the
/// parent; anything else leaves the parent untouched. An empty set is never
/// a verdict: a parent whose expansion has not been generated yet must not
/// finish early.
pub fn aggregate_verdict(children: &[Status]) -> Option<Status> {
    if children.iter().any(|s| *s == Status::Error) {
        return Some(Status::Error);
    }
    if !children.is_empty() && children.iter().all(|s| *s == Status::Finish) {
        return Some(Status::Finish);
    }
    None
}

/// The sibling ordinal to promote next, given the most-recently finished
/// one. Nothing finished means nothing to advance: the first ordinal was
/// already promoted at expansion time.
pub fn next_sibling_number(latest_finished: Option<i32>) -> Option<i32> {
    latest_finished.map(|n| n + 1)
}

/// An expansion runs in parallel only when every resolved command allows it.
pub fn combined_parallel<I>(flags: I) -> bool
where
    I: IntoIterator<Item = bool>,
{
    flags.into_iter().all(|f| f)
}

/// Dispatch dedup: a fresh task message goes out only while the log has no
/// expansion and no standing success (a success superseded by a newer error
/// reopens dispatch).
pub fn should_dispatch(replies: ReplyTimes, has_expansion: bool) -> bool {
    if has_expansion {
        return false;
    }
    match (replies.last_success, replies.last_error) {
        (None, _) => true,
        (Some(success), Some(error)) => success < error,
        (Some(_), None) => false,
    }
}

/// Outcome of the liveness check for one remote module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecision {
    /// Healthy and recently confirmed; leave it alone.
    Skip,
    /// Healthy but a probe went unanswered: flag it down and probe again.
    MarkUnhealthyAndResend,
    /// Send (or resend) a connect probe.
    Send,
}

/// Liveness decision for a remote module during the periodic pass.
pub fn probe_decision(
    healthy: bool,
    has_unanswered_probe: bool,
    last_reply_age: Option<Duration>,
    period: Duration,
) -> ProbeDecision {
    if healthy {
        if has_unanswered_probe {
            return ProbeDecision::MarkUnhealthyAndResend;
        }
        if last_reply_age.is_some_and(|age| age < period) {
            return ProbeDecision::Skip;
        }
    }
    ProbeDecision::Send
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn times(success_min: Option<i64>, error_min: Option<i64>) -> ReplyTimes {
        let at = |min: i64| Utc.with_ymd_and_hms(2024, 1, 1, 0, min as u32, 0).unwrap();
        ReplyTimes {
            last_success: success_min.map(at),
            last_error: error_min.map(at),
        }
    }

    #[test]
    fn test_aggregate_error_dominates() {
        use Status::*;
        assert_eq!(aggregate_verdict(&[Finish, Error, Progress]), Some(Error));
        assert_eq!(aggregate_verdict(&[Error]), Some(Error));
        assert_eq!(aggregate_verdict(&[Error, Finish]), Some(Error));
    }

    #[test]
    fn test_aggregate_all_finish() {
        use Status::*;
        assert_eq!(aggregate_verdict(&[Finish, Finish]), Some(Finish));
        assert_eq!(aggregate_verdict(&[Finish]), Some(Finish));
    }

    #[test]
    fn test_aggregate_no_verdict_while_running() {
        use Status::*;
        assert_eq!(aggregate_verdict(&[Finish, Progress]), None);
        assert_eq!(aggregate_verdict(&[Set, Set]), None);
        assert_eq!(aggregate_verdict(&[Finish, Cancel]), None);
        assert_eq!(aggregate_verdict(&[]), None);
    }

    #[test]
    fn test_next_sibling_number() {
        assert_eq!(next_sibling_number(None), None);
        assert_eq!(next_sibling_number(Some(1)), Some(2));
        assert_eq!(next_sibling_number(Some(7)), Some(8));
    }

    #[test]
    fn test_combined_parallel() {
        assert!(combined_parallel([true, true]));
        assert!(!combined_parallel([true, false, true]));
        assert!(combined_parallel(std::iter::empty::<bool>()));
    }

    #[test]
    fn test_dispatch_dedup() {
        // never while an expansion exists
        assert!(!should_dispatch(times(None, None), true));
        assert!(!should_dispatch(times(None, Some(5)), true));
        // no reply at all: dispatch (and retry on later passes)
        assert!(should_dispatch(times(None, None), false));
        assert!(should_dispatch(times(None, Some(5)), false));
        // standing success suppresses
        assert!(!should_dispatch(times(Some(5), None), false));
        assert!(!should_dispatch(times(Some(5), Some(3)), false));
        // an error newer than the last success reopens dispatch
        assert!(should_dispatch(times(Some(3), Some(5)), false));
    }

    #[test]
    fn test_probe_decisions() {
        let period = Duration::minutes(5);
        // fresh reply, healthy: skip
        assert_eq!(
            probe_decision(true, false, Some(Duration::minutes(2)), period),
            ProbeDecision::Skip
        );
        // stale reply: probe again
        assert_eq!(
            probe_decision(true, false, Some(Duration::minutes(9)), period),
            ProbeDecision::Send
        );
        // no reply ever seen: probe
        assert_eq!(probe_decision(true, false, None, period), ProbeDecision::Send);
        // healthy with an unanswered probe: fail fast, resend in the same pass
        assert_eq!(
            probe_decision(true, true, Some(Duration::minutes(1)), period),
            ProbeDecision::MarkUnhealthyAndResend
        );
        // unhealthy modules are always probed for recovery
        assert_eq!(probe_decision(false, true, None, period), ProbeDecision::Send);
        assert_eq!(
            probe_decision(false, false, Some(Duration::minutes(1)), period),
            ProbeDecision::Send
        );
    }
}
