//! Sentinel Acquisition Server Library
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod acquisition;
pub mod config;
pub mod server;

// Re-export commonly used types for convenience
pub use acquisition::{
    AcquisitionRegistry, AcquisitionRequest, CopernicusClient, Credentials, FileBackedRegistry,
    PollManager, RequestScheduler, RequestState,
};
pub use config::{AppConfig, CliConfig, FileConfig};
pub use server::{run_server, ServerState};
