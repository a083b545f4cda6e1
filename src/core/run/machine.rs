//! Pure status-transition logic for [`WorkflowRun`]. No I/O happens here;
//! callers persist and publish the returned runs.

use chrono::{DateTime, Utc};

use super::types::{RunStatus, WorkflowRun};
use crate::core::events::EventType;
use crate::core::orchestrator::{ExternalRunState, ExternalState};

/// Total mapping from the external vocabulary. Unrecognized states map to
/// `Queued`, never to a terminal status.
pub fn map_external_state(state: &ExternalState) -> RunStatus {
    match state {
        ExternalState::Queued => RunStatus::Queued,
        ExternalState::Scheduled => RunStatus::Scheduled,
        ExternalState::Running => RunStatus::Running,
        ExternalState::UpForRetry => RunStatus::UpForRetry,
        ExternalState::UpForReschedule => RunStatus::UpForReschedule,
        ExternalState::Success => RunStatus::Success,
        ExternalState::Failed => RunStatus::Failed,
        ExternalState::UpstreamFailed => RunStatus::UpstreamFailed,
        ExternalState::Skipped => RunStatus::Skipped,
        ExternalState::Removed => RunStatus::Removed,
        ExternalState::Unknown(_) => RunStatus::Queued,
    }
}

/// Legal status changes. Non-terminal runs may move anywhere; a terminal
/// run only leaves through an explicit retry (to `Queued`) or stop (to
/// `Failed`).
pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
    if from == to {
        return true;
    }
    if !from.is_terminal() {
        return true;
    }
    matches!(to, RunStatus::Queued | RunStatus::Failed)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub run: WorkflowRun,
    pub previous: RunStatus,
    pub changed: bool,
}

impl Transition {
    fn unchanged(run: &WorkflowRun) -> Self {
        Self {
            run: run.clone(),
            previous: run.status,
            changed: false,
        }
    }

    pub fn event_type(&self) -> Option<EventType> {
        if !self.changed {
            return None;
        }
        event_for_transition(self.previous, self.run.status)
    }
}

/// Fold an external observation into the local run.
///
/// A terminal local status is locked in: no observation overrides it.
/// Re-applying the same observation is a no-op.
pub fn apply_observed_state(
    run: &WorkflowRun,
    observed: &ExternalRunState,
    now: DateTime<Utc>,
) -> Transition {
    let previous = run.status;
    if previous.is_terminal() {
        return Transition::unchanged(run);
    }
    let next = map_external_state(&observed.state);
    if next == previous {
        return Transition::unchanged(run);
    }

    let mut updated = run.clone();
    updated.status = next;
    updated.updated_at = now;

    if next == RunStatus::Running && updated.start_date.is_none() {
        updated.start_date = Some(observed.start_date.unwrap_or(now));
    }
    if next.is_terminal() {
        if updated.start_date.is_none() {
            updated.start_date = observed.start_date;
        }
        updated.end_date = Some(observed.end_date.unwrap_or(now));
    } else {
        updated.end_date = None;
    }

    Transition {
        run: updated,
        previous,
        changed: true,
    }
}

/// Force `Failed` locally, without waiting for the orchestrator to agree.
pub fn stop(run: &WorkflowRun, now: DateTime<Utc>) -> Transition {
    if run.status == RunStatus::Failed {
        return Transition::unchanged(run);
    }
    let mut updated = run.clone();
    updated.status = RunStatus::Failed;
    updated.end_date = Some(run.end_date.unwrap_or(now));
    updated.updated_at = now;
    Transition {
        run: updated,
        previous: run.status,
        changed: true,
    }
}

/// Back to `Queued` with both timestamps cleared.
pub fn retry(run: &WorkflowRun, now: DateTime<Utc>) -> Transition {
    let mut updated = run.clone();
    updated.status = RunStatus::Queued;
    updated.start_date = None;
    updated.end_date = None;
    updated.updated_at = now;
    let changed = run.status != RunStatus::Queued || run.start_date.is_some() || run.end_date.is_some();
    Transition {
        run: updated,
        previous: run.status,
        changed,
    }
}

/// Event announcing a status change observed from the orchestrator.
pub fn event_for_transition(previous: RunStatus, next: RunStatus) -> Option<EventType> {
    if previous == next {
        return None;
    }
    Some(match next {
        RunStatus::Running => EventType::WorkflowStarted,
        RunStatus::Success => EventType::WorkflowCompleted,
        s if s.is_terminal() => EventType::WorkflowFailed,
        _ => EventType::WorkflowUpdated,
    })
}
