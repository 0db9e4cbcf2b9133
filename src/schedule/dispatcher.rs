//! Timer-driven sweep over due scheduled jobs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;

use super::job::{JobStore, PostSender, ScheduledJob};

struct Runner {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Finds due scheduled jobs on a recurring timer and dispatches each through
/// the governed send path.
///
/// One instance per process, started at boot and stopped at graceful
/// shutdown. Sweeps are re-entrancy guarded: a tick arriving while a sweep is
/// still running is a no-op, so a slow upstream never stacks sweeps.
pub struct ScheduledDispatcher {
    inner: Arc<Inner>,
    runner: Mutex<Option<Runner>>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    sender: Arc<dyn PostSender>,
    config: DispatcherConfig,
    sweeping: AtomicBool,
    /// Consecutive dispatch failures per job, kept in memory only. A job that
    /// keeps failing is dropped once it hits the configured ceiling instead
    /// of retrying on every sweep forever.
    failures: Mutex<HashMap<Uuid, u32>>,
}

impl ScheduledDispatcher {
    /// Create a dispatcher over the given collaborators.
    pub fn new(
        store: Arc<dyn JobStore>,
        sender: Arc<dyn PostSender>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                sender,
                config,
                sweeping: AtomicBool::new(false),
                failures: Mutex::new(HashMap::new()),
            }),
            runner: Mutex::new(None),
        }
    }

    /// Arm the recurring timer and fire one sweep immediately.
    ///
    /// Idempotent; calling `start` while running is a no-op.
    pub fn start(&self, interval: Duration) {
        let mut runner = self.runner.lock();
        if runner.is_some() {
            warn!("scheduled dispatcher already running");
            return;
        }

        info!(interval_ms = interval.as_millis() as u64, "starting scheduled dispatcher");
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => inner.sweep().await,
                }
            }
            debug!("scheduled dispatcher timer stopped");
        });

        *runner = Some(Runner { stop_tx, handle });
    }

    /// Disarm the timer. An in-flight sweep runs to completion.
    pub fn stop(&self) {
        if let Some(runner) = self.runner.lock().take() {
            info!("stopping scheduled dispatcher");
            let _ = runner.stop_tx.send(());
            drop(runner.handle);
        }
    }

    /// Whether the recurring timer is armed.
    pub fn is_running(&self) -> bool {
        self.runner.lock().is_some()
    }

    /// Run one sweep now, outside the timer. No-op if a sweep is in flight.
    pub async fn sweep_now(&self) {
        self.inner.sweep().await;
    }
}

impl Inner {
    async fn sweep(&self) {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            trace!("sweep already in progress, skipping tick");
            return;
        }

        self.run_sweep().await;
        self.sweeping.store(false, Ordering::SeqCst);
    }

    async fn run_sweep(&self) {
        let now = Utc::now();
        let jobs = match self.store.due_jobs(now).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "failed to query due jobs");
                return;
            }
        };
        // Failure counts for jobs that are no longer due (deleted elsewhere,
        // rescheduled) have nothing left to describe, even when this sweep
        // finds nothing to dispatch.
        let due_ids: Vec<Uuid> = jobs.iter().map(|job| job.id).collect();
        self.failures
            .lock()
            .retain(|id, _| due_ids.contains(id));

        if jobs.is_empty() {
            trace!("no due jobs");
            return;
        }

        debug!(count = jobs.len(), "dispatching due jobs");
        // Sequential on purpose: bounds upstream load, and one job's failure
        // never aborts the rest of the sweep.
        for job in jobs {
            self.dispatch_one(job).await;
        }
    }

    async fn dispatch_one(&self, job: ScheduledJob) {
        let owner = match self.store.resolve_owner(&job.owner_id).await {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                warn!(
                    job_id = %job.id,
                    owner_id = %job.owner_id,
                    "owner no longer resolvable, deleting orphaned job"
                );
                self.delete(job.id).await;
                return;
            }
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    error = %e,
                    "owner lookup failed, leaving job for next sweep"
                );
                return;
            }
        };

        match self.sender.send_post(&owner, &job.payload).await {
            Ok(receipt) => {
                info!(
                    job_id = %job.id,
                    owner = %owner.handle,
                    uri = %receipt.uri,
                    "scheduled post dispatched"
                );
                self.delete(job.id).await;
            }
            Err(e) => {
                let failures = {
                    let mut failures = self.failures.lock();
                    let count = failures.entry(job.id).or_insert(0);
                    *count += 1;
                    *count
                };
                if failures >= self.config.max_job_failures {
                    error!(
                        job_id = %job.id,
                        failures = failures,
                        error = %e,
                        "dispatch failure ceiling reached, dropping job"
                    );
                    self.delete(job.id).await;
                } else {
                    warn!(
                        job_id = %job.id,
                        failures = failures,
                        error = %e,
                        "dispatch failed, job retained for next sweep"
                    );
                }
            }
        }
    }

    async fn delete(&self, id: Uuid) {
        if let Err(e) = self.store.delete_job(id).await {
            warn!(job_id = %id, error = %e, "failed to delete job");
        }
        self.failures.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use crate::schedule::job::{Owner, PostPayload, PostReceipt};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::sync::Notify;

    struct MockStore {
        jobs: Mutex<Vec<ScheduledJob>>,
        missing_owners: Mutex<Vec<String>>,
        query_count: std::sync::atomic::AtomicU32,
        /// Signalled on every `due_jobs` call, so tests can wait for the
        /// dispatcher's timer task instead of guessing at scheduling.
        queried: Notify,
        /// When set, `due_jobs` blocks until notified.
        gate: Option<Arc<Notify>>,
    }

    impl MockStore {
        fn with_jobs(jobs: Vec<ScheduledJob>) -> Self {
            Self {
                jobs: Mutex::new(jobs),
                missing_owners: Mutex::new(Vec::new()),
                query_count: std::sync::atomic::AtomicU32::new(0),
                queried: Notify::new(),
                gate: None,
            }
        }

        fn job_ids(&self) -> Vec<Uuid> {
            self.jobs.lock().iter().map(|j| j.id).collect()
        }
    }

    #[async_trait]
    impl JobStore for MockStore {
        async fn due_jobs(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledJob>> {
            self.query_count
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.queried.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(self
                .jobs
                .lock()
                .iter()
                .filter(|job| job.due_at <= now)
                .cloned()
                .collect())
        }

        async fn delete_job(&self, id: Uuid) -> anyhow::Result<()> {
            self.jobs.lock().retain(|job| job.id != id);
            Ok(())
        }

        async fn resolve_owner(&self, owner_id: &str) -> anyhow::Result<Option<Owner>> {
            if self.missing_owners.lock().iter().any(|o| o == owner_id) {
                return Ok(None);
            }
            Ok(Some(Owner {
                id: owner_id.to_string(),
                handle: format!("{owner_id}.example.social"),
            }))
        }
    }

    struct MockSender {
        sent: Mutex<Vec<Uuid>>,
        /// Posts whose text matches an entry here fail with a transient error.
        failing_texts: Mutex<Vec<String>>,
    }

    impl MockSender {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failing_texts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PostSender for MockSender {
        async fn send_post(
            &self,
            _owner: &Owner,
            payload: &PostPayload,
        ) -> Result<PostReceipt, UpstreamError> {
            if self.failing_texts.lock().iter().any(|t| *t == payload.text) {
                return Err(UpstreamError::Transient("upstream unavailable".into()));
            }
            let marker = Uuid::new_v4();
            self.sent.lock().push(marker);
            Ok(PostReceipt {
                uri: format!("at://did:plc:test/app.feed.post/{marker}"),
                cid: "bafyreihash".to_string(),
            })
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn due_job(text: &str) -> ScheduledJob {
        ScheduledJob {
            id: Uuid::new_v4(),
            owner_id: "owner-1".to_string(),
            due_at: Utc::now() - chrono::Duration::seconds(5),
            payload: PostPayload::text(text),
        }
    }

    fn dispatcher(
        store: Arc<MockStore>,
        sender: Arc<MockSender>,
        max_job_failures: u32,
    ) -> ScheduledDispatcher {
        ScheduledDispatcher::new(
            store,
            sender,
            DispatcherConfig {
                sweep_interval_ms: 60_000,
                max_job_failures,
            },
        )
    }

    #[tokio::test]
    async fn test_sweep_dispatches_and_deletes_due_jobs() {
        init_tracing();
        let store = Arc::new(MockStore::with_jobs(vec![due_job("one"), due_job("two")]));
        let sender = Arc::new(MockSender::new());
        let dispatcher = dispatcher(store.clone(), sender.clone(), 10);

        dispatcher.sweep_now().await;

        assert!(store.job_ids().is_empty());
        assert_eq!(sender.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_future_jobs_are_left_alone() {
        let mut job = due_job("later");
        job.due_at = Utc::now() + chrono::Duration::hours(1);
        let store = Arc::new(MockStore::with_jobs(vec![job]));
        let sender = Arc::new(MockSender::new());
        let dispatcher = dispatcher(store.clone(), sender.clone(), 10);

        dispatcher.sweep_now().await;

        assert_eq!(store.job_ids().len(), 1);
        assert!(sender.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_the_sweep() {
        let jobs = vec![due_job("first"), due_job("second"), due_job("third")];
        let second_id = jobs[1].id;
        let store = Arc::new(MockStore::with_jobs(jobs));
        let sender = Arc::new(MockSender::new());
        sender.failing_texts.lock().push("second".to_string());
        let dispatcher = dispatcher(store.clone(), sender.clone(), 10);

        dispatcher.sweep_now().await;

        // Jobs one and three dispatched and deleted; two retained.
        assert_eq!(store.job_ids(), vec![second_id]);
        assert_eq!(sender.sent.lock().len(), 2);

        // Next sweep, the upstream has recovered.
        sender.failing_texts.lock().clear();
        dispatcher.sweep_now().await;

        assert!(store.job_ids().is_empty());
        assert_eq!(sender.sent.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_orphaned_job_deleted_without_dispatch() {
        let job = due_job("ghost");
        let store = Arc::new(MockStore::with_jobs(vec![job]));
        store.missing_owners.lock().push("owner-1".to_string());
        let sender = Arc::new(MockSender::new());
        let dispatcher = dispatcher(store.clone(), sender.clone(), 10);

        dispatcher.sweep_now().await;

        assert!(store.job_ids().is_empty());
        assert!(sender.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_sweep_is_a_no_op() {
        let gate = Arc::new(Notify::new());
        let mut store = MockStore::with_jobs(vec![due_job("slow")]);
        store.gate = Some(gate.clone());
        let store = Arc::new(store);
        let sender = Arc::new(MockSender::new());
        let dispatcher = Arc::new(dispatcher(store.clone(), sender.clone(), 10));

        let slow = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.sweep_now().await })
        };
        // Let the first sweep reach the gate inside due_jobs.
        tokio::task::yield_now().await;
        assert_eq!(store.query_count.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Second sweep while the first is blocked: skipped entirely.
        dispatcher.sweep_now().await;
        assert_eq!(store.query_count.load(std::sync::atomic::Ordering::SeqCst), 1);

        gate.notify_one();
        slow.await.unwrap();

        // The job went out exactly once.
        assert_eq!(sender.sent.lock().len(), 1);
        assert!(store.job_ids().is_empty());
    }

    #[tokio::test]
    async fn test_permanently_failing_job_is_dropped_at_ceiling() {
        let job = due_job("cursed");
        let store = Arc::new(MockStore::with_jobs(vec![job]));
        let sender = Arc::new(MockSender::new());
        sender.failing_texts.lock().push("cursed".to_string());
        let dispatcher = dispatcher(store.clone(), sender.clone(), 3);

        dispatcher.sweep_now().await;
        dispatcher.sweep_now().await;
        assert_eq!(store.job_ids().len(), 1);

        // Third failure hits the ceiling.
        dispatcher.sweep_now().await;
        assert!(store.job_ids().is_empty());
        assert!(sender.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stale_failure_counts_pruned_by_empty_sweep() {
        let job = due_job("flaky");
        let job_id = job.id;
        let store = Arc::new(MockStore::with_jobs(vec![job]));
        let sender = Arc::new(MockSender::new());
        sender.failing_texts.lock().push("flaky".to_string());
        let dispatcher = dispatcher(store.clone(), sender.clone(), 10);

        dispatcher.sweep_now().await;
        assert_eq!(
            dispatcher.inner.failures.lock().get(&job_id).copied(),
            Some(1)
        );

        // The job disappears out of band (deleted or rescheduled by the
        // host application); the next sweep finds nothing due but still
        // drops the stale count.
        store.jobs.lock().clear();
        dispatcher.sweep_now().await;
        assert!(dispatcher.inner.failures.lock().is_empty());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_disarms() {
        let store = Arc::new(MockStore::with_jobs(Vec::new()));
        let sender = Arc::new(MockSender::new());
        let dispatcher = dispatcher(store.clone(), sender, 10);

        dispatcher.start(Duration::from_secs(60));
        dispatcher.start(Duration::from_secs(60));
        assert!(dispatcher.is_running());

        // The first tick fires immediately; wait for the timer task to
        // actually reach the store rather than guessing at scheduling.
        tokio::time::timeout(Duration::from_secs(5), store.queried.notified())
            .await
            .expect("timer task never swept");
        assert!(store.query_count.load(std::sync::atomic::Ordering::SeqCst) >= 1);

        dispatcher.stop();
        assert!(!dispatcher.is_running());
    }
}
