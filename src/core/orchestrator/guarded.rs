use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::client::{ExternalRunHandle, ExternalRunState, OrchestratorClient, SubTaskState};
use crate::core::error::{CoreError, CoreResult};
use crate::core::resilience::{CircuitBreaker, RetryPolicy, retry_async};

/// Wraps a client so every verb runs inside the retry policy, and the whole
/// retry sequence runs inside the breaker. An open circuit is never retried.
pub struct GuardedOrchestrator<C> {
    inner: C,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
}

impl<C: OrchestratorClient> GuardedOrchestrator<C> {
    pub fn new(inner: C, breaker: Arc<CircuitBreaker>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            breaker,
            policy,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn guarded<T, F, Fut>(&self, op: &str, f: F) -> CoreResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = CoreResult<T>> + Send,
        T: Send,
    {
        self.breaker
            .call(retry_async(&self.policy, op, is_retryable, f))
            .await
    }
}

fn is_retryable(e: &CoreError) -> bool {
    matches!(e, CoreError::ExternalService { .. })
}

#[async_trait]
impl<C: OrchestratorClient> OrchestratorClient for GuardedOrchestrator<C> {
    async fn trigger(
        &self,
        stage_id: &str,
        run_id: &str,
        parameters: &serde_json::Value,
    ) -> CoreResult<ExternalRunHandle> {
        let op = format!("trigger {}/{}", stage_id, run_id);
        self.guarded(&op, || self.inner.trigger(stage_id, run_id, parameters))
            .await
    }

    async fn query(&self, stage_id: &str, run_id: &str) -> CoreResult<ExternalRunState> {
        let op = format!("query {}/{}", stage_id, run_id);
        self.guarded(&op, || self.inner.query(stage_id, run_id)).await
    }

    async fn list_sub_tasks(&self, stage_id: &str, run_id: &str) -> CoreResult<Vec<SubTaskState>> {
        let op = format!("list_sub_tasks {}/{}", stage_id, run_id);
        self.guarded(&op, || self.inner.list_sub_tasks(stage_id, run_id))
            .await
    }

    async fn cancel(&self, stage_id: &str, run_id: &str) -> CoreResult<()> {
        let op = format!("cancel {}/{}", stage_id, run_id);
        self.guarded(&op, || self.inner.cancel(stage_id, run_id)).await
    }

    async fn reset(&self, stage_id: &str, run_id: &str) -> CoreResult<()> {
        let op = format!("reset {}/{}", stage_id, run_id);
        self.guarded(&op, || self.inner.reset(stage_id, run_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::orchestrator::client::ExternalState;
    use crate::core::orchestrator::scripted::ScriptedOrchestrator;
    use crate::core::resilience::BreakerState;
    use std::time::Duration;

    fn guarded(fake: Arc<ScriptedOrchestrator>) -> GuardedOrchestrator<Arc<ScriptedOrchestrator>> {
        let breaker = Arc::new(CircuitBreaker::new("airflow", 3, Duration::from_secs(30)));
        let policy = RetryPolicy::new(3, Duration::from_secs(2), 2.0, Duration::from_secs(30), 0.0);
        GuardedOrchestrator::new(fake, breaker, policy)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_inside_one_breaker_call() {
        let fake = Arc::new(ScriptedOrchestrator::new());
        fake.push_query_error("r1");
        fake.push_query_error("r1");
        fake.push_query_state("r1", ExternalState::Running);
        let client = guarded(fake.clone());

        let state = client.query("etl", "r1").await.unwrap();
        assert_eq!(state.state, ExternalState::Running);
        assert_eq!(fake.query_count(), 3);
        assert_eq!(client.breaker().snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_count_once_and_open_circuit_is_not_retried() {
        let fake = Arc::new(ScriptedOrchestrator::new());
        fake.set_fail_cancel(true);
        let client = guarded(fake.clone());

        for _ in 0..3 {
            let err = client.cancel("etl", "r1").await.unwrap_err();
            assert!(matches!(err, CoreError::ExternalService { .. }));
        }
        assert_eq!(fake.cancel_attempts(), 9);
        assert_eq!(client.breaker().state(), BreakerState::Open);

        let err = client.cancel("etl", "r1").await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(fake.cancel_attempts(), 9);
    }
}
