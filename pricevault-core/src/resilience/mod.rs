//! Failure handling around provider calls: circuit breaking, retry, cancellation.

mod cancel;
mod circuit_breaker;
mod controller;
mod retry;

pub use cancel::CancelToken;
pub use circuit_breaker::{
    BreakerConfig, CallError, CircuitBreaker, CircuitState, Transition,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_TIMEOUT,
};
pub use controller::{ResilienceController, ResilienceError};
pub use retry::RetryPolicy;
