use super::{at, sample_run};
use crate::core::orchestrator::{ExternalRunState, ExternalState};
use crate::core::run::{RunStatus, apply_observed_state};

fn vocabulary() -> Vec<ExternalState> {
    vec![
        ExternalState::Queued,
        ExternalState::Scheduled,
        ExternalState::Running,
        ExternalState::UpForRetry,
        ExternalState::UpForReschedule,
        ExternalState::Success,
        ExternalState::Failed,
        ExternalState::UpstreamFailed,
        ExternalState::Skipped,
        ExternalState::Removed,
        ExternalState::Unknown("restarting".to_string()),
    ]
}

/// Every observation sequence of length `len` over the vocabulary.
fn sequences(len: usize) -> Vec<Vec<ExternalState>> {
    let vocab = vocabulary();
    let mut out: Vec<Vec<ExternalState>> = vec![vec![]];
    for _ in 0..len {
        out = out
            .into_iter()
            .flat_map(|prefix| {
                vocab.iter().map(move |s| {
                    let mut next = prefix.clone();
                    next.push(s.clone());
                    next
                })
            })
            .collect();
    }
    out
}

#[test]
fn end_date_is_set_iff_terminal_and_start_date_is_set_once() {
    for seq in sequences(4) {
        let mut run = sample_run(RunStatus::Queued);
        let mut first_start = None;
        for (i, state) in seq.iter().enumerate() {
            let now = at(i as i64 + 1);
            let t = apply_observed_state(&run, &ExternalRunState::bare(state.clone()), now);
            run = t.run;

            assert_eq!(
                run.end_date.is_some(),
                run.status.is_terminal(),
                "sequence {:?} at step {}",
                seq,
                i
            );
            match (first_start, run.start_date) {
                (None, Some(start)) => first_start = Some(start),
                (Some(prev), current) => assert_eq!(current, Some(prev), "sequence {:?}", seq),
                (None, None) => {}
            }
        }
    }
}

#[test]
fn applying_any_observation_twice_changes_nothing_the_second_time() {
    for seq in sequences(3) {
        let mut run = sample_run(RunStatus::Queued);
        for (i, state) in seq.iter().enumerate() {
            let observed = ExternalRunState::bare(state.clone());
            let first = apply_observed_state(&run, &observed, at(i as i64 * 2 + 1));
            let second = apply_observed_state(&first.run, &observed, at(i as i64 * 2 + 2));
            assert!(!second.changed, "sequence {:?}", seq);
            assert_eq!(second.run, first.run);
            assert_eq!(second.event_type(), None);
            run = second.run;
        }
    }
}

#[test]
fn at_most_one_terminal_event_per_sequence() {
    for seq in sequences(4) {
        let mut run = sample_run(RunStatus::Queued);
        let mut terminal_events = 0;
        for (i, state) in seq.iter().enumerate() {
            let t = apply_observed_state(&run, &ExternalRunState::bare(state.clone()), at(i as i64));
            if t.changed && t.run.status.is_terminal() {
                terminal_events += 1;
            }
            run = t.run;
        }
        assert!(terminal_events <= 1, "sequence {:?}", seq);
    }
}
