//! Per-category FIFO serialization of governed requests.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::config::{Category, QueueConfig};
use crate::error::UpstreamError;

use super::governor::{ExecuteOptions, RequestGovernor};

/// A queued operation, type-erased down to "run yourself and deliver your
/// result through your captured channel".
struct QueueEntry {
    run: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
}

#[derive(Default)]
struct CategoryQueue {
    entries: VecDeque<QueueEntry>,
    draining: bool,
}

/// The outcome of an enqueued request.
///
/// Resolves in submission order relative to other entries in the same
/// category once the drain reaches it.
pub struct PendingRequest<T> {
    rx: oneshot::Receiver<Result<T, UpstreamError>>,
}

impl<T> Future for PendingRequest<T> {
    type Output = Result<T, UpstreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(UpstreamError::Fatal(
                "request queue dropped before completion".into(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Serializes governed requests per category.
///
/// Each category owns one FIFO and at most one drain task at a time. The
/// drain layers the category's floor spacing on top of the governor's own
/// pacing, defending against bursty enqueue patterns. Categories drain
/// independently; ordering across categories is unspecified.
pub struct RequestQueue {
    governor: Arc<RequestGovernor>,
    // The inner mutex keeps the map value Sync; queue entries hold boxed
    // FnOnce closures, which are Send but not Sync.
    queues: Arc<DashMap<Category, Mutex<CategoryQueue>>>,
    config: QueueConfig,
}

impl RequestQueue {
    /// Create a queue in front of the given governor.
    pub fn new(governor: Arc<RequestGovernor>, config: QueueConfig) -> Self {
        Self {
            governor,
            queues: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Submit an operation for governed, in-order execution.
    ///
    /// The entry is appended synchronously, so submission order is the order
    /// of `enqueue` calls. If the category's queue is at its depth bound the
    /// entry is shed and the returned future resolves with
    /// [`UpstreamError::Overloaded`].
    pub fn enqueue<T, F, Fut>(
        &self,
        category: Category,
        operation: F,
        options: ExecuteOptions,
    ) -> PendingRequest<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, UpstreamError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let governor = self.governor.clone();
        let entry = QueueEntry {
            run: Box::new(move || -> BoxFuture<'static, ()> {
                Box::pin(async move {
                    let result = governor.execute(category, operation, options).await;
                    // The caller may have dropped its PendingRequest.
                    let _ = tx.send(result);
                })
            }),
        };

        let start_drain = {
            let queue_cell = self.queues.entry(category).or_default();
            let mut queue = queue_cell.lock();
            if queue.entries.len() >= self.config.max_depth {
                warn!(
                    category = %category,
                    depth = queue.entries.len(),
                    "queue at capacity, shedding request"
                );
                drop(entry);
                return PendingRequest {
                    rx: reject(self.config.max_depth),
                };
            }
            queue.entries.push_back(entry);
            trace!(
                category = %category,
                depth = queue.entries.len(),
                "request enqueued"
            );
            if queue.draining {
                false
            } else {
                queue.draining = true;
                true
            }
        };

        if start_drain {
            debug!(category = %category, "starting drain task");
            let queues = self.queues.clone();
            let governor = self.governor.clone();
            tokio::spawn(async move {
                drain(queues, governor, category).await;
            });
        }

        PendingRequest { rx }
    }

    /// Pending entries for a category, for monitoring.
    pub fn depth(&self, category: Category) -> usize {
        self.queues
            .get(&category)
            .map(|queue| queue.lock().entries.len())
            .unwrap_or(0)
    }
}

fn reject<T: Send + 'static>(
    max_depth: usize,
) -> oneshot::Receiver<Result<T, UpstreamError>> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(Err(UpstreamError::Overloaded(max_depth)));
    rx
}

/// Drain one category until its queue is empty, then mark it idle.
///
/// The lock is only held to pop; never across an await.
async fn drain(
    queues: Arc<DashMap<Category, Mutex<CategoryQueue>>>,
    governor: Arc<RequestGovernor>,
    category: Category,
) {
    let min_delay = governor
        .limiter()
        .limits()
        .for_category(category)
        .min_delay();

    loop {
        let entry = {
            let queue_cell = match queues.get(&category) {
                Some(queue) => queue,
                None => return,
            };
            let mut queue = queue_cell.lock();
            match queue.entries.pop_front() {
                Some(entry) => entry,
                None => {
                    queue.draining = false;
                    trace!(category = %category, "queue drained, going idle");
                    return;
                }
            }
        };

        // Extra spacing on top of the governor's own pacing.
        tokio::time::sleep(min_delay).await;
        (entry.run)().await;
    }
}
