mod error;
mod models;
mod poller;
mod prober;
mod processing;
mod provider;
mod registry;
mod scheduler;

pub use error::AcquisitionError;
pub use models::{AcquisitionRequest, Credentials, DownloadOutcome, ProductMetadata, RequestState};
pub use poller::PollManager;
pub use prober::{LocalProbe, StorageProber};
pub use processing::{NoOpProcessor, ProductProcessor};
pub use provider::{CopernicusClient, ProductProvider, ProviderError};
pub use registry::{AcquisitionRegistry, FileBackedRegistry};
pub use scheduler::RequestScheduler;
