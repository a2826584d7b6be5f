//! Acquisition scheduler core.
//!
//! The durable state machine behind every acquisition request: resolves or
//! creates registry records, runs download attempts, reconciles persisted
//! state with what actually sits in local storage, and drives the polling
//! engine for requests the provider cannot serve immediately.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::error::AcquisitionError;
use super::models::{AcquisitionRequest, Credentials, DownloadOutcome, RequestState};
use super::poller::PollManager;
use super::prober::{LocalProbe, StorageProber, ARCHIVE_SUFFIX, EXTRACTED_SUFFIX};
use super::processing::ProductProcessor;
use super::provider::{ProductProvider, ProviderError};
use super::registry::AcquisitionRegistry;

/// Orchestrates the acquisition lifecycle for remote satellite products.
///
/// All state transitions for one id are serialized through that id's async
/// lock, so a caller-triggered attempt and a concurrently firing polling
/// job can never interleave a read-modify-write on the same record.
pub struct RequestScheduler {
    registry: Arc<dyn AcquisitionRegistry>,
    provider: Arc<dyn ProductProvider>,
    processor: Arc<dyn ProductProcessor>,
    poller: Arc<PollManager>,
    prober: StorageProber,
    data_dir: PathBuf,
    attempt_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RequestScheduler {
    /// Create a new scheduler and bind it to the poll manager.
    pub fn new(
        registry: Arc<dyn AcquisitionRegistry>,
        provider: Arc<dyn ProductProvider>,
        processor: Arc<dyn ProductProcessor>,
        poller: Arc<PollManager>,
        data_dir: PathBuf,
    ) -> Arc<Self> {
        let prober = StorageProber::new(&data_dir);
        let scheduler = Arc::new(Self {
            registry,
            provider,
            processor,
            poller: Arc::clone(&poller),
            prober,
            data_dir,
            attempt_locks: Mutex::new(HashMap::new()),
        });
        poller.bind_scheduler(&scheduler);
        scheduler
    }

    /// Request acquisition of a product, returning the resulting state.
    ///
    /// Creates the registry record on first sight of the id (after a
    /// successful metadata lookup), tries one immediate download when the
    /// state allows it, and schedules the recurring polling job when the
    /// product is not immediately retrievable. Persists the registry before
    /// returning; this is the explicit durability checkpoint.
    pub async fn request(
        &self,
        id: &str,
        credentials: &Credentials,
    ) -> Result<RequestState, AcquisitionError> {
        let mut state = match self.registry.get(id) {
            Some(record) => {
                info!("Request for {} already made - state is {}", id, record.state);
                record.state
            }
            None => {
                let metadata = match self.provider.lookup_metadata(id, credentials).await {
                    Ok(metadata) => metadata,
                    Err(ProviderError::NotFound) => {
                        warn!(
                            "Product with id {} does not exist online - request will not be made",
                            id
                        );
                        return Ok(RequestState::Invalid);
                    }
                    Err(ProviderError::Other(e)) => return Err(e.into()),
                };
                let record = AcquisitionRequest::new(id.to_string(), metadata.title);
                info!("Added new request: {:?}", record);
                self.registry.upsert(record);
                RequestState::New
            }
        };

        if !self.poller.is_active(id) && state.is_retry_eligible() {
            info!("Trying to download {} directly..", id);
            state = self.run_attempt(id, credentials).await?;
            if state != RequestState::Available {
                info!("Data unavailable - starting download schedule for {}", id);
                self.poller.schedule(id, credentials.clone());
            }
        }

        self.registry.persist()?;
        Ok(state)
    }

    /// Run one download attempt for an id. Shared by the immediate path in
    /// [`request`](Self::request) and by the polling engine.
    pub async fn run_attempt(
        &self,
        id: &str,
        credentials: &Credentials,
    ) -> Result<RequestState, AcquisitionError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let record = self
            .registry
            .get(id)
            .ok_or_else(|| AcquisitionError::RequestNotFound(id.to_string()))?;

        // Local storage is the source of truth; it overrides whatever state
        // was persisted.
        let current = self.reconcile_local(&record)?;
        if current == RequestState::Available {
            debug!("Data for {} is available in storage", id);
            self.poller.cancel(id);
            return Ok(current);
        }
        if !current.is_retry_eligible() {
            self.poller.cancel(id);
            return Ok(current);
        }

        let old_state = current;
        self.update_record(id, |r| r.state = RequestState::Incomplete)?;
        debug!("Initiating download for id {}", id);

        let outcome = match self.provider.download(id, &self.data_dir, credentials).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // An unclassified provider failure is treated as transient;
                // the transition table stays total.
                warn!("Download for {} failed before classification: {}", id, e);
                DownloadOutcome::TransientError(e.to_string())
            }
        };

        match outcome {
            DownloadOutcome::Success => {
                self.update_record(id, |r| r.state = RequestState::Available)?;
                self.poller.cancel(id);
            }
            DownloadOutcome::StagingTriggered => {
                info!(
                    "Data for id {} is not available - retrieval from the long-term archive has been initiated",
                    id
                );
                self.update_record(id, |r| r.state = RequestState::Pending)?;
            }
            DownloadOutcome::StagingRefused => {
                info!(
                    "Data for id {} is not available - no retrieval could be initiated",
                    id
                );
                self.update_record(id, |r| r.state = RequestState::Unavailable)?;
            }
            DownloadOutcome::TransientError(detail) => {
                // The hub is probably down for maintenance.
                error!("Provider server error for {}: {}", id, detail);
                self.update_record(id, |r| r.state = old_state)?;
            }
            DownloadOutcome::PermanentServerError(detail) => {
                error!("Permanent provider fault for {}: {}", id, detail);
                self.update_record(id, |r| r.state = RequestState::Unavailable)?;
            }
            DownloadOutcome::ChecksumMismatch => {
                error!("Invalid checksum of download for {}", id);
                let archive = self.archive_path(&record.title);
                if archive.exists() {
                    std::fs::remove_file(&archive)
                        .with_context(|| format!("Failed to remove corrupt archive {archive:?}"))
                        .map_err(AcquisitionError::Internal)?;
                    self.update_record(id, |r| r.state = old_state)?;
                } else {
                    // No artifact to clean up - nothing left to retry from.
                    self.update_record(id, |r| r.state = RequestState::Unavailable)?;
                }
            }
        }
        self.update_record(id, |r| r.last_query = Some(Utc::now()))?;

        // One more look at local storage decides the reported state.
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| AcquisitionError::RequestNotFound(id.to_string()))?;
        let final_state = self.reconcile_local(&record)?;
        debug!("Current state is {} for id {}", final_state, id);
        if final_state == RequestState::Available {
            self.poller.cancel(id);
        }
        Ok(final_state)
    }

    /// Fail with `InvalidState` unless the record is exactly `AVAILABLE`.
    pub fn assert_available(&self, id: &str) -> Result<AcquisitionRequest, AcquisitionError> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| AcquisitionError::RequestNotFound(id.to_string()))?;
        if record.state != RequestState::Available {
            return Err(AcquisitionError::InvalidState {
                id: id.to_string(),
                expected: RequestState::Available,
                actual: record.state,
            });
        }
        Ok(record)
    }

    /// Path of the raw product archive; requires the record to be
    /// `AVAILABLE`.
    pub fn raw_artifact_path(&self, id: &str) -> Result<PathBuf, AcquisitionError> {
        let record = self.assert_available(id)?;
        Ok(self.archive_path(&record.title))
    }

    /// Unpack the product archive and hand it to the processing pipeline.
    ///
    /// On success the record moves to `PROCESSED` and becomes eligible for
    /// [`remove_request`](Self::remove_request). The pipeline's output path
    /// is returned to the caller unchanged.
    pub async fn process_available(&self, id: &str) -> Result<PathBuf, AcquisitionError> {
        let record = self.assert_available(id)?;

        let data_dir = self.data_dir.clone();
        let title = record.title.clone();
        let id_owned = id.to_string();
        let processor = Arc::clone(&self.processor);
        let output = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            let product_dir = unpack_product(&data_dir, &title)?;
            processor.process(&product_dir, &id_owned)
        })
        .await
        .map_err(|e| AcquisitionError::Internal(anyhow::anyhow!("Processing task panicked: {e}")))?
        .map_err(AcquisitionError::Internal)?;

        self.update_record(id, |r| r.state = RequestState::Processed)?;
        self.registry.persist()?;
        info!("Processed product {} -> {:?}", id, output);
        Ok(output)
    }

    /// Delete the local artifacts and the registry record for a consumed
    /// product. Callable only once processing marked the record
    /// `PROCESSED`.
    pub fn remove_request(&self, id: &str) -> Result<(), AcquisitionError> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| AcquisitionError::RequestNotFound(id.to_string()))?;
        if record.state != RequestState::Processed {
            return Err(AcquisitionError::InvalidState {
                id: id.to_string(),
                expected: RequestState::Processed,
                actual: record.state,
            });
        }

        self.poller.cancel(id);

        let archive = self.archive_path(&record.title);
        if archive.exists() {
            debug!("Removing archive for id {}..", id);
            std::fs::remove_file(&archive)
                .with_context(|| format!("Failed to remove archive {archive:?}"))
                .map_err(AcquisitionError::Internal)?;
        }
        let extracted = self.extracted_path(&record.title);
        if extracted.is_dir() {
            debug!("Removing extracted product for id {}..", id);
            std::fs::remove_dir_all(&extracted)
                .with_context(|| format!("Failed to remove product dir {extracted:?}"))
                .map_err(AcquisitionError::Internal)?;
        }

        self.registry.remove(id);
        self.registry.persist()?;
        info!("Removed acquisition request {}", id);
        Ok(())
    }

    /// Current record for an id, if any. Read-only view for the front door.
    pub fn get_request(&self, id: &str) -> Option<AcquisitionRequest> {
        self.registry.get(id)
    }

    fn archive_path(&self, title: &str) -> PathBuf {
        self.data_dir.join(format!("{title}{ARCHIVE_SUFFIX}"))
    }

    fn extracted_path(&self, title: &str) -> PathBuf {
        self.data_dir.join(format!("{title}{EXTRACTED_SUFFIX}"))
    }

    /// Adopt the prober's finding into the registry and return the
    /// resulting state. With no local evidence the persisted state stands.
    fn reconcile_local(
        &self,
        record: &AcquisitionRequest,
    ) -> Result<RequestState, AcquisitionError> {
        let probed = match self.prober.probe(&record.title)? {
            LocalProbe::Available => RequestState::Available,
            LocalProbe::Incomplete => RequestState::Incomplete,
            LocalProbe::NoEvidence => record.state,
        };
        if probed != record.state {
            debug!(
                "Local storage overrides state for {}: {} -> {}",
                record.id, record.state, probed
            );
            self.update_record(&record.id, |r| r.state = probed)?;
        }
        Ok(probed)
    }

    fn update_record(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut AcquisitionRequest),
    ) -> Result<(), AcquisitionError> {
        let mut record = self
            .registry
            .get(id)
            .ok_or_else(|| AcquisitionError::RequestNotFound(id.to_string()))?;
        mutate(&mut record);
        self.registry.upsert(record);
        Ok(())
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.attempt_locks.lock().unwrap();
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Extract the product archive next to itself and drop the zip so there are
/// no duplicates. Idempotent when the extracted directory already exists.
fn unpack_product(data_dir: &Path, title: &str) -> Result<PathBuf> {
    let archive_path = data_dir.join(format!("{title}{ARCHIVE_SUFFIX}"));
    let extracted_path = data_dir.join(format!("{title}{EXTRACTED_SUFFIX}"));
    if !extracted_path.is_dir() {
        let file = std::fs::File::open(&archive_path)
            .with_context(|| format!("Failed to open product archive {archive_path:?}"))?;
        let mut archive = zip::ZipArchive::new(file)
            .with_context(|| format!("Failed to read product archive {archive_path:?}"))?;
        archive
            .extract(data_dir)
            .with_context(|| format!("Failed to extract product archive {archive_path:?}"))?;
        std::fs::remove_file(&archive_path)
            .with_context(|| format!("Failed to remove extracted archive {archive_path:?}"))?;
    }
    Ok(extracted_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::models::ProductMetadata;
    use crate::acquisition::processing::NoOpProcessor;
    use crate::acquisition::registry::FileBackedRegistry;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    const TITLE: &str = "S2A_MSIL1C_20220104T103431_N0301_R108_T32UMA_20220104T123507";

    /// Scripted provider: per-id metadata and a queue of download outcomes.
    struct ScriptedProvider {
        titles: Mutex<HashMap<String, String>>,
        outcomes: Mutex<HashMap<String, VecDeque<DownloadOutcome>>>,
        lookups: AtomicUsize,
        downloads: AtomicUsize,
        /// Write the archive file on Success, like the real client does.
        write_archive_on_success: bool,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                titles: Mutex::new(HashMap::new()),
                outcomes: Mutex::new(HashMap::new()),
                lookups: AtomicUsize::new(0),
                downloads: AtomicUsize::new(0),
                write_archive_on_success: true,
            }
        }

        fn with_title(self, id: &str, title: &str) -> Self {
            self.titles
                .lock()
                .unwrap()
                .insert(id.to_string(), title.to_string());
            self
        }

        fn push_outcome(&self, id: &str, outcome: DownloadOutcome) {
            self.outcomes
                .lock()
                .unwrap()
                .entry(id.to_string())
                .or_default()
                .push_back(outcome);
        }

        fn lookup_count(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }

        fn download_count(&self) -> usize {
            self.downloads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProductProvider for ScriptedProvider {
        async fn lookup_metadata(
            &self,
            id: &str,
            _credentials: &Credentials,
        ) -> Result<ProductMetadata, ProviderError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            match self.titles.lock().unwrap().get(id) {
                Some(title) => Ok(ProductMetadata {
                    id: id.to_string(),
                    title: title.clone(),
                    checksum_md5: None,
                }),
                None => Err(ProviderError::NotFound),
            }
        }

        async fn download(
            &self,
            id: &str,
            destination_dir: &Path,
            _credentials: &Credentials,
        ) -> Result<DownloadOutcome> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .get_mut(id)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(DownloadOutcome::TransientError("script exhausted".into()));
            if outcome == DownloadOutcome::Success && self.write_archive_on_success {
                let title = self.titles.lock().unwrap().get(id).unwrap().clone();
                std::fs::write(destination_dir.join(format!("{title}.zip")), b"archive")?;
            }
            Ok(outcome)
        }
    }

    struct Fixture {
        _data_dir: TempDir,
        scheduler: Arc<RequestScheduler>,
        provider: Arc<ScriptedProvider>,
        poller: Arc<PollManager>,
        registry: Arc<FileBackedRegistry>,
        data_path: PathBuf,
    }

    fn make_fixture(provider: ScriptedProvider) -> Fixture {
        let data_dir = TempDir::new().unwrap();
        let data_path = data_dir.path().to_path_buf();
        let registry = Arc::new(
            FileBackedRegistry::new(data_path.join("schedule.json")).unwrap(),
        );
        let provider = Arc::new(provider);
        let poller = PollManager::new(Duration::from_secs(1800), Duration::from_secs(1));
        let scheduler = RequestScheduler::new(
            Arc::clone(&registry) as Arc<dyn AcquisitionRegistry>,
            Arc::clone(&provider) as Arc<dyn ProductProvider>,
            Arc::new(NoOpProcessor),
            Arc::clone(&poller),
            data_path.clone(),
        );
        Fixture {
            _data_dir: data_dir,
            scheduler,
            provider,
            poller,
            registry,
            data_path,
        }
    }

    fn creds() -> Credentials {
        Credentials::new("user", "pass")
    }

    #[tokio::test]
    async fn test_unknown_id_with_successful_download() {
        // Scenario: fresh id, metadata resolves, download succeeds outright.
        let provider = ScriptedProvider::new().with_title("P1", "T1");
        let fx = make_fixture(provider);
        fx.provider.push_outcome("P1", DownloadOutcome::Success);

        let state = fx.scheduler.request("P1", &creds()).await.unwrap();

        assert_eq!(state, RequestState::Available);
        let record = fx.registry.get("P1").unwrap();
        assert_eq!(record.title, "T1");
        assert_eq!(record.state, RequestState::Available);
        assert!(record.last_query.is_some());
        assert!(!fx.poller.is_active("P1"));
    }

    #[tokio::test]
    async fn test_staging_then_success_on_next_tick() {
        // Scenario: archive is offline; first attempt triggers staging and
        // schedules the job, the next firing completes the download.
        let provider = ScriptedProvider::new().with_title("P2", TITLE);
        let fx = make_fixture(provider);
        fx.provider
            .push_outcome("P2", DownloadOutcome::StagingTriggered);
        fx.provider.push_outcome("P2", DownloadOutcome::Success);

        let state = fx.scheduler.request("P2", &creds()).await.unwrap();
        assert_eq!(state, RequestState::Pending);
        assert!(fx.poller.is_active("P2"));

        // What the poll manager runs when the job fires.
        let state = fx.scheduler.run_attempt("P2", &creds()).await.unwrap();
        assert_eq!(state, RequestState::Available);
        assert!(!fx.poller.is_active("P2"));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_cleans_artifact_and_reverts() {
        // Scenario: corrupt download leaves a stale archive; the scheduler
        // deletes it and reverts to the pre-attempt state.
        let provider = ScriptedProvider::new().with_title("P3", TITLE);
        let fx = make_fixture(provider);
        fx.registry.upsert(AcquisitionRequest {
            id: "P3".to_string(),
            state: RequestState::Incomplete,
            title: TITLE.to_string(),
            last_query: None,
        });
        fx.poller.schedule("P3", creds());
        fx.provider
            .push_outcome("P3", DownloadOutcome::ChecksumMismatch);

        let archive = fx.data_path.join(format!("{TITLE}.zip"));

        // Wraps the script so the corrupt archive appears on disk the way
        // the real client leaves it: renamed into place before the
        // mismatch is classified.
        struct CorruptingProvider {
            inner: Arc<ScriptedProvider>,
        }
        #[async_trait]
        impl ProductProvider for CorruptingProvider {
            async fn lookup_metadata(
                &self,
                id: &str,
                credentials: &Credentials,
            ) -> Result<ProductMetadata, ProviderError> {
                self.inner.lookup_metadata(id, credentials).await
            }
            async fn download(
                &self,
                id: &str,
                destination_dir: &Path,
                credentials: &Credentials,
            ) -> Result<DownloadOutcome> {
                let outcome = self.inner.download(id, destination_dir, credentials).await?;
                if outcome == DownloadOutcome::ChecksumMismatch {
                    std::fs::write(destination_dir.join(format!("{TITLE}.zip")), b"corrupt")?;
                }
                Ok(outcome)
            }
        }

        // Rebuild the scheduler around the corrupting wrapper.
        let poller = PollManager::new(Duration::from_secs(1800), Duration::from_secs(1));
        poller.schedule("P3", creds());
        let scheduler = RequestScheduler::new(
            Arc::clone(&fx.registry) as Arc<dyn AcquisitionRegistry>,
            Arc::new(CorruptingProvider {
                inner: Arc::clone(&fx.provider),
            }),
            Arc::new(NoOpProcessor),
            Arc::clone(&poller),
            fx.data_path.clone(),
        );

        let state = scheduler.run_attempt("P3", &creds()).await.unwrap();

        assert_eq!(state, RequestState::Incomplete);
        assert!(!archive.exists(), "corrupt archive must be deleted");
        assert!(poller.is_active("P3"), "job stays scheduled for a retry");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_without_artifact_goes_unavailable() {
        let provider = ScriptedProvider::new().with_title("P3", TITLE);
        let fx = make_fixture(provider);
        fx.registry.upsert(AcquisitionRequest {
            id: "P3".to_string(),
            state: RequestState::Incomplete,
            title: TITLE.to_string(),
            last_query: None,
        });
        fx.provider
            .push_outcome("P3", DownloadOutcome::ChecksumMismatch);

        let state = fx.scheduler.run_attempt("P3", &creds()).await.unwrap();
        assert_eq!(state, RequestState::Unavailable);
    }

    #[tokio::test]
    async fn test_unknown_id_is_invalid_and_creates_no_record() {
        // Scenario: the provider has never heard of this id.
        let provider = ScriptedProvider::new();
        let fx = make_fixture(provider);

        let state = fx.scheduler.request("P4", &creds()).await.unwrap();
        assert_eq!(state, RequestState::Invalid);
        assert!(fx.registry.get("P4").is_none());
        assert!(!fx.poller.is_active("P4"));

        // A second request repeats the lookup; the id stays unknown.
        let state = fx.scheduler.request("P4", &creds()).await.unwrap();
        assert_eq!(state, RequestState::Invalid);
        assert_eq!(fx.provider.lookup_count(), 2);
        assert_eq!(fx.provider.download_count(), 0);
    }

    #[tokio::test]
    async fn test_process_requires_available_state() {
        // Scenario: processing a NEW record must be rejected.
        let provider = ScriptedProvider::new().with_title("P5", TITLE);
        let fx = make_fixture(provider);
        fx.registry.upsert(AcquisitionRequest {
            id: "P5".to_string(),
            state: RequestState::New,
            title: TITLE.to_string(),
            last_query: None,
        });

        let err = fx.scheduler.process_available("P5").await.unwrap_err();
        assert!(matches!(
            err,
            AcquisitionError::InvalidState {
                actual: RequestState::New,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_second_request_after_available_is_idempotent() {
        let provider = ScriptedProvider::new().with_title("P1", "T1");
        let fx = make_fixture(provider);
        fx.provider.push_outcome("P1", DownloadOutcome::Success);

        let first = fx.scheduler.request("P1", &creds()).await.unwrap();
        let second = fx.scheduler.request("P1", &creds()).await.unwrap();

        assert_eq!(first, RequestState::Available);
        assert_eq!(second, RequestState::Available);
        assert_eq!(fx.provider.download_count(), 1);
        // Only the creation lookup happened; no duplicate row either.
        assert_eq!(fx.provider.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_error_reverts_and_keeps_job() {
        let provider = ScriptedProvider::new().with_title("P6", TITLE);
        let fx = make_fixture(provider);
        fx.provider.push_outcome(
            "P6",
            DownloadOutcome::TransientError("maintenance".to_string()),
        );

        let state = fx.scheduler.request("P6", &creds()).await.unwrap();

        // Reverted to the pre-attempt state NEW; the job keeps retrying.
        assert_eq!(state, RequestState::New);
        assert!(fx.poller.is_active("P6"));
        assert!(fx.registry.get("P6").unwrap().last_query.is_some());
    }

    #[tokio::test]
    async fn test_permanent_server_error_pins_unavailable() {
        let provider = ScriptedProvider::new().with_title("P7", TITLE);
        let fx = make_fixture(provider);
        fx.provider.push_outcome(
            "P7",
            DownloadOutcome::PermanentServerError("NullPointerException".to_string()),
        );

        let state = fx.scheduler.request("P7", &creds()).await.unwrap();
        assert_eq!(state, RequestState::Unavailable);

        // The job exists but its next firing stops without provider
        // contact because the state is no longer retry-eligible.
        assert!(fx.poller.is_active("P7"));
        let state = fx.scheduler.run_attempt("P7", &creds()).await.unwrap();
        assert_eq!(state, RequestState::Unavailable);
        assert!(!fx.poller.is_active("P7"));
        assert_eq!(fx.provider.download_count(), 1);
    }

    #[tokio::test]
    async fn test_local_artifact_short_circuits_pending_request() {
        // Data shows up out-of-band while the record is PENDING; the next
        // attempt adopts it without contacting the provider.
        let provider = ScriptedProvider::new().with_title("P8", TITLE);
        let fx = make_fixture(provider);
        fx.registry.upsert(AcquisitionRequest {
            id: "P8".to_string(),
            state: RequestState::Pending,
            title: TITLE.to_string(),
            last_query: None,
        });
        fx.poller.schedule("P8", creds());

        std::fs::write(fx.data_path.join(format!("{TITLE}.zip")), b"archive").unwrap();

        let state = fx.scheduler.run_attempt("P8", &creds()).await.unwrap();
        assert_eq!(state, RequestState::Available);
        assert!(!fx.poller.is_active("P8"));
        assert_eq!(fx.provider.download_count(), 0);
    }

    #[tokio::test]
    async fn test_run_attempt_without_record_fails() {
        let provider = ScriptedProvider::new();
        let fx = make_fixture(provider);
        let err = fx.scheduler.run_attempt("ghost", &creds()).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::RequestNotFound(_)));
    }

    #[tokio::test]
    async fn test_raw_artifact_path_requires_available() {
        let provider = ScriptedProvider::new().with_title("P9", TITLE);
        let fx = make_fixture(provider);
        fx.registry.upsert(AcquisitionRequest {
            id: "P9".to_string(),
            state: RequestState::Available,
            title: TITLE.to_string(),
            last_query: None,
        });

        let path = fx.scheduler.raw_artifact_path("P9").unwrap();
        assert_eq!(path, fx.data_path.join(format!("{TITLE}.zip")));

        assert!(matches!(
            fx.scheduler.raw_artifact_path("ghost"),
            Err(AcquisitionError::RequestNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_request_requires_processed() {
        let provider = ScriptedProvider::new().with_title("P10", TITLE);
        let fx = make_fixture(provider);
        fx.registry.upsert(AcquisitionRequest {
            id: "P10".to_string(),
            state: RequestState::Available,
            title: TITLE.to_string(),
            last_query: None,
        });

        assert!(matches!(
            fx.scheduler.remove_request("P10"),
            Err(AcquisitionError::InvalidState { .. })
        ));

        fx.registry.upsert(AcquisitionRequest {
            id: "P10".to_string(),
            state: RequestState::Processed,
            title: TITLE.to_string(),
            last_query: None,
        });
        std::fs::write(fx.data_path.join(format!("{TITLE}.zip")), b"archive").unwrap();
        std::fs::create_dir(fx.data_path.join(format!("{TITLE}.SAFE"))).unwrap();

        fx.scheduler.remove_request("P10").unwrap();
        assert!(fx.registry.get("P10").is_none());
        assert!(!fx.data_path.join(format!("{TITLE}.zip")).exists());
        assert!(!fx.data_path.join(format!("{TITLE}.SAFE")).exists());
    }

    #[tokio::test]
    async fn test_staging_refused_stops_future_downloads() {
        let provider = ScriptedProvider::new().with_title("P11", TITLE);
        let fx = make_fixture(provider);
        fx.provider
            .push_outcome("P11", DownloadOutcome::StagingRefused);

        let state = fx.scheduler.request("P11", &creds()).await.unwrap();
        assert_eq!(state, RequestState::Unavailable);

        // Next firing cancels itself in the local-check step.
        let state = fx.scheduler.run_attempt("P11", &creds()).await.unwrap();
        assert_eq!(state, RequestState::Unavailable);
        assert_eq!(fx.provider.download_count(), 1);
    }
}
