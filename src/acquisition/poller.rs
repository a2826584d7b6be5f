//! Background polling engine for unresolved acquisition requests.
//!
//! Ticks at second granularity and re-runs the scheduler's attempt logic
//! for every due request at a fixed per-request interval. Guarantees at
//! most one job per product id and dispatches each due attempt as its own
//! task; the tick loop itself never blocks on a provider call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::models::Credentials;
use super::scheduler::RequestScheduler;

struct PollJob {
    credentials: Credentials,
    next_run_at: DateTime<Utc>,
    in_flight: bool,
}

/// Recurring-task manager, one repeating job per product id.
///
/// Holds no domain state beyond the id-to-job mapping; all durable state
/// lives in the acquisition registry.
pub struct PollManager {
    jobs: Mutex<HashMap<String, PollJob>>,
    poll_interval: Duration,
    tick_interval: Duration,
    /// Late-bound to break the construction cycle with the scheduler.
    scheduler: Mutex<Option<Weak<RequestScheduler>>>,
}

impl PollManager {
    pub fn new(poll_interval: Duration, tick_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            poll_interval,
            tick_interval,
            scheduler: Mutex::new(None),
        })
    }

    /// Bind the scheduler whose attempt logic due jobs invoke. Called once
    /// during wiring, after both components exist.
    pub fn bind_scheduler(&self, scheduler: &Arc<RequestScheduler>) {
        *self.scheduler.lock().unwrap() = Some(Arc::downgrade(scheduler));
    }

    /// Register a recurring job for an id. Registering an id that already
    /// has an active job is a no-op; returns false in that case.
    pub fn schedule(&self, id: &str, credentials: Credentials) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(id) {
            debug!("Polling job for {} already active - not scheduling", id);
            return false;
        }
        info!(
            "Scheduling polling job for {} every {:?}",
            id, self.poll_interval
        );
        jobs.insert(
            id.to_string(),
            PollJob {
                credentials,
                next_run_at: Utc::now() + self.poll_interval,
                in_flight: false,
            },
        );
        true
    }

    /// Cancel and deregister the job for an id, if any. Safe to call while
    /// a firing for that id is in flight; the completing firing will not
    /// resurrect the job.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.jobs.lock().unwrap().remove(id).is_some();
        if removed {
            info!("Cancelled polling job for {}", id);
        }
        removed
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// Main tick loop - call from a spawned task. Runs until the shutdown
    /// token is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Poll manager starting (tick={:?}, poll_interval={:?})",
            self.tick_interval, self.poll_interval
        );
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.dispatch_due();
                }
                _ = shutdown.cancelled() => {
                    info!("Poll manager shutting down");
                    break;
                }
            }
        }
    }

    /// Collect due jobs and spawn one attempt task per job. Never executes
    /// an attempt inline.
    fn dispatch_due(self: &Arc<Self>) {
        let scheduler = match self
            .scheduler
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
        {
            Some(scheduler) => scheduler,
            None => return,
        };

        for (id, credentials) in self.collect_due() {
            debug!("Polling job due for {}", id);
            let manager = Arc::clone(self);
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                // A failing attempt must never take the loop down; the job
                // simply fires again on its next interval.
                match scheduler.run_attempt(&id, &credentials).await {
                    Ok(state) => debug!("Scheduled attempt for {} ended in {}", id, state),
                    Err(e) => warn!("Scheduled attempt for {} failed: {}", id, e),
                }
                manager.finish_firing(&id);
            });
        }
    }

    /// Mark and return the jobs due now, advancing each one a full
    /// interval. A job already in flight is never selected.
    fn collect_due(&self) -> Vec<(String, Credentials)> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        jobs.iter_mut()
            .filter(|(_, job)| !job.in_flight && job.next_run_at <= now)
            .map(|(id, job)| {
                job.in_flight = true;
                job.next_run_at = now + self.poll_interval;
                (id.clone(), job.credentials.clone())
            })
            .collect()
    }

    /// Clear the in-flight marker after a firing completes. If the job was
    /// cancelled while the firing ran, the entry is gone and stays gone.
    fn finish_firing(&self, id: &str) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(id) {
            job.in_flight = false;
        }
    }

    #[cfg(test)]
    fn force_due(&self, id: &str) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(id) {
            job.next_run_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::models::{
        AcquisitionRequest, DownloadOutcome, ProductMetadata, RequestState,
    };
    use crate::acquisition::processing::NoOpProcessor;
    use crate::acquisition::provider::{ProductProvider, ProviderError};
    use crate::acquisition::registry::{AcquisitionRegistry, FileBackedRegistry};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn make_manager() -> Arc<PollManager> {
        PollManager::new(Duration::from_secs(1800), Duration::from_secs(1))
    }

    fn creds() -> Credentials {
        Credentials::new("user", "pass")
    }

    fn due_ids(manager: &PollManager) -> Vec<String> {
        manager.collect_due().into_iter().map(|(id, _)| id).collect()
    }

    /// Counts downloads; every attempt ends in staging so the job stays.
    #[derive(Default)]
    struct CountingProvider {
        downloads: AtomicUsize,
    }

    #[async_trait]
    impl ProductProvider for CountingProvider {
        async fn lookup_metadata(
            &self,
            id: &str,
            _credentials: &Credentials,
        ) -> Result<ProductMetadata, ProviderError> {
            Ok(ProductMetadata {
                id: id.to_string(),
                title: format!("TITLE_{id}"),
                checksum_md5: None,
            })
        }

        async fn download(
            &self,
            _id: &str,
            _destination_dir: &Path,
            _credentials: &Credentials,
        ) -> Result<DownloadOutcome> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(DownloadOutcome::StagingTriggered)
        }
    }

    #[test]
    fn test_schedule_is_once_per_id() {
        let manager = make_manager();
        assert!(manager.schedule("P1", creds()));
        assert!(!manager.schedule("P1", creds()));
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_cancel_removes_job() {
        let manager = make_manager();
        manager.schedule("P1", creds());
        assert!(manager.cancel("P1"));
        assert!(!manager.is_active("P1"));
        assert!(!manager.cancel("P1"));
    }

    #[test]
    fn test_new_job_is_not_immediately_due() {
        let manager = make_manager();
        manager.schedule("P1", creds());
        assert!(due_ids(&manager).is_empty());
    }

    #[test]
    fn test_due_job_fires_once_per_interval() {
        let manager = make_manager();
        manager.schedule("P1", creds());
        manager.force_due("P1");

        assert_eq!(due_ids(&manager), vec!["P1".to_string()]);
        // Rescheduled a full interval ahead, so not due again.
        manager.finish_firing("P1");
        assert!(due_ids(&manager).is_empty());
    }

    #[test]
    fn test_in_flight_job_is_not_redispatched() {
        let manager = make_manager();
        manager.schedule("P1", creds());
        manager.force_due("P1");

        assert_eq!(due_ids(&manager).len(), 1);
        // Still in flight: forcing it due again must not redispatch.
        manager.force_due("P1");
        assert!(due_ids(&manager).is_empty());
    }

    #[test]
    fn test_cancel_during_firing_leaves_no_stale_mapping() {
        let manager = make_manager();
        manager.schedule("P1", creds());
        manager.force_due("P1");
        assert_eq!(due_ids(&manager).len(), 1);

        // Cancelled while the firing is in flight; completion must not
        // bring the job back.
        manager.cancel("P1");
        manager.finish_firing("P1");
        assert!(!manager.is_active("P1"));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_due_runs_attempt_and_clears_in_flight() {
        let data_dir = TempDir::new().unwrap();
        let registry = Arc::new(
            FileBackedRegistry::new(data_dir.path().join("schedule.json")).unwrap(),
        );
        registry.upsert(AcquisitionRequest {
            id: "P1".to_string(),
            state: RequestState::Pending,
            title: "TITLE_P1".to_string(),
            last_query: None,
        });
        let provider = Arc::new(CountingProvider::default());
        let manager = make_manager();
        let scheduler = RequestScheduler::new(
            Arc::clone(&registry) as Arc<dyn AcquisitionRegistry>,
            Arc::clone(&provider) as Arc<dyn ProductProvider>,
            Arc::new(NoOpProcessor),
            Arc::clone(&manager),
            data_dir.path().to_path_buf(),
        );

        manager.schedule("P1", creds());
        manager.force_due("P1");
        manager.dispatch_due();

        // The spawned attempt reaches the provider; once its completion
        // clears the in-flight marker, the job is dispatchable again.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            manager.force_due("P1");
            if !manager.collect_due().is_empty() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "firing never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(provider.downloads.load(Ordering::SeqCst), 1);
        assert!(manager.is_active("P1"));
        drop(scheduler);

        // With the scheduler gone, dispatch is a no-op.
        manager.finish_firing("P1");
        manager.force_due("P1");
        manager.dispatch_due();
        assert_eq!(provider.downloads.load(Ordering::SeqCst), 1);
    }
}
