pub mod breaker;
pub mod retry;

pub use breaker::{BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use retry::{RetryPolicy, retry_async, retry_blocking};
