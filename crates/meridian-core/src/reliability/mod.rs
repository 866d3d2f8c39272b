//! Reliability patterns layered under the durable execution model.
//!
//! - [`RetryPolicy`] - configurable retry with exponential backoff, reused
//!   directly by [`crate::model::NodeSpec`] and [`crate::model::TaskNode`].
//! - [`CircuitBreakerConfig`] / [`DistributedCircuitBreaker`] - failure
//!   isolation shared across engines via [`CircuitBreakerStore`].
//! - [`TimeoutManager`] - schedule-to-start / start-to-close / heartbeat
//!   timeout calculation for dispatched nodes.

mod circuit_breaker;
mod distributed_circuit_breaker;
mod retry;
mod timeout;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitState};
pub use distributed_circuit_breaker::{
    CircuitBreakerError, CircuitBreakerPermit, CircuitBreakerStore, CircuitStoreError,
    DistributedCircuitBreaker, StoredBreakerState,
};
pub use retry::RetryPolicy;
pub use timeout::{TaskTimingInfo, TimedOutTask, TimeoutConfig, TimeoutError, TimeoutManager, TimeoutType};
