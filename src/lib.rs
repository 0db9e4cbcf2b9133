//! Outpost - Outbound Rate Governance and Scheduled Dispatch
//!
//! This crate is the outbound subsystem of a backend-for-frontend for a
//! multi-column social client. Every call to the rate-limited upstream
//! service goes through a governed path that paces requests per traffic
//! category, retries on transient and rate-limit failures, and serializes
//! bursty callers through per-category FIFO queues. A timer-driven
//! dispatcher fires scheduled "send later" posts through the same path.

pub mod config;
pub mod error;
pub mod govern;
pub mod schedule;

use std::sync::Arc;

use config::OutpostConfig;
use govern::{RateLimiter, RequestGovernor, RequestQueue};
use schedule::{JobStore, PostSender, ScheduledDispatcher};

/// Owned context wiring the whole subsystem together.
///
/// All state lives on this object; construct one per process (or several in
/// tests) and share the pieces via `Arc`. There are no process-wide globals.
pub struct Outpost {
    limiter: Arc<RateLimiter>,
    governor: Arc<RequestGovernor>,
    queue: RequestQueue,
    config: OutpostConfig,
}

impl Outpost {
    /// Build the limiter, governor, and queue from configuration.
    pub fn new(config: OutpostConfig) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.limits.clone()));
        let governor = Arc::new(RequestGovernor::new(
            limiter.clone(),
            config.retry.clone(),
        ));
        let queue = RequestQueue::new(governor.clone(), config.queue.clone());
        Self {
            limiter,
            governor,
            queue,
            config,
        }
    }

    /// The shared rate limiter, for monitoring surfaces.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The request governor for direct governed calls.
    pub fn governor(&self) -> &Arc<RequestGovernor> {
        &self.governor
    }

    /// The per-category request queue.
    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// The configuration this context was built from.
    pub fn config(&self) -> &OutpostConfig {
        &self.config
    }

    /// Build a dispatcher over the given collaborators, configured with this
    /// context's dispatcher settings. The caller owns its lifecycle.
    pub fn dispatcher(
        &self,
        store: Arc<dyn JobStore>,
        sender: Arc<dyn PostSender>,
    ) -> ScheduledDispatcher {
        ScheduledDispatcher::new(store, sender, self.config.dispatcher.clone())
    }
}
