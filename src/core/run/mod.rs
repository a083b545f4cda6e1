mod machine;
mod types;

pub use machine::{
    Transition, apply_observed_state, can_transition, event_for_transition, map_external_state,
    retry, stop,
};
pub use types::{
    ChainContext, ChainHop, Job, JobExecution, JobExecutionStatus, RunConfiguration, RunStatus,
    TriggerType, WorkflowRun,
};

#[cfg(test)]
mod tests;
