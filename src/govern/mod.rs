//! Outbound rate governance: limiting, backoff, retries, and queueing.

pub mod backoff;
mod governor;
mod limiter;
mod queue;

pub use governor::{ExecuteOptions, RequestGovernor, RetryEvent};
pub use limiter::{CategoryStatus, RateLimiter};
pub use queue::{PendingRequest, RequestQueue};
