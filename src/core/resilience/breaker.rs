use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::core::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub trip_count: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    trip_count: u64,
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`].
///
/// A permit that is dropped without being resolved through
/// [`Permit::success`] or [`Permit::failure`] gives a half-open trial slot
/// back, so a cancelled caller cannot wedge the breaker.
#[must_use]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl Permit<'_> {
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success();
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.abandon_trial();
        }
    }
}

/// Fail-fast guard for one external dependency.
///
/// CLOSED counts consecutive failures and trips to OPEN at
/// `failure_threshold`. OPEN rejects every call until `recovery_timeout` has
/// elapsed since the trip, then exactly one trial call is admitted in
/// HALF_OPEN. The trial's outcome closes or re-opens the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
                trip_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // A poisoned lock only means another thread panicked mid-update; the
    // counters are still usable.
    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn open_error(&self) -> CoreError {
        CoreError::CircuitOpen {
            service: self.name.clone(),
        }
    }

    pub fn try_acquire(&self) -> CoreResult<Permit<'_>> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(Permit {
                breaker: self,
                trial: false,
                resolved: false,
            }),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(self.recovery_timeout);
                if elapsed < self.recovery_timeout {
                    return Err(self.open_error());
                }
                info!("Circuit breaker {} entering half-open", self.name);
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                Ok(Permit {
                    breaker: self,
                    trial: true,
                    resolved: false,
                })
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.open_error());
                }
                inner.trial_in_flight = true;
                Ok(Permit {
                    breaker: self,
                    trial: true,
                    resolved: false,
                })
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            info!("Circuit breaker {} closed", self.name);
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn on_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                warn!("Circuit breaker {} trial call failed, re-opening", self.name);
                self.trip(&mut inner);
            }
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    warn!(
                        "Circuit breaker {} opened after {} consecutive failures",
                        self.name, inner.failure_count
                    );
                    self.trip(&mut inner);
                }
            }
            // Late failure from a call admitted before the trip
            BreakerState::Open => {}
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
        inner.trip_count += 1;
    }

    fn abandon_trial(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            trip_count: inner.trip_count,
        }
    }

    /// Run `fut` under the breaker. Only external-service errors count as
    /// failures; any other error means the dependency answered.
    pub async fn call<T, F>(&self, fut: F) -> CoreResult<T>
    where
        F: Future<Output = CoreResult<T>>,
    {
        let permit = self.try_acquire()?;
        match fut.await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) if e.is_external() => {
                permit.failure();
                Err(e)
            }
            Err(e) => {
                permit.success();
                Err(e)
            }
        }
    }
}

/// Shared breakers keyed by dependency name.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        name: &str,
        failure_threshold: u32,
        recovery_timeout: Duration,
    ) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, failure_threshold, recovery_timeout))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let map = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        map.get(name).cloned()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let map = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<_> = map.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
