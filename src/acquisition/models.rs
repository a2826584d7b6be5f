//! Data models for the acquisition scheduler.
//!
//! Defines request states, acquisition records, provider outcomes, and
//! per-call credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an acquisition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    /// Record just created, no download attempted yet.
    New,
    /// The provider's long-term archive is staging the product.
    Pending,
    /// A download attempt is in flight or a partial artifact exists locally.
    Incomplete,
    /// The product archive is present in local storage.
    Available,
    /// The provider definitively cannot serve the product. Terminal.
    Unavailable,
    /// The id is unknown to the provider. Never persisted.
    Invalid,
    /// The product has been consumed by the processing pipeline. Terminal.
    Processed,
}

impl RequestState {
    /// Returns true if the scheduler will still attempt or re-attempt a
    /// download from this state.
    pub fn is_retry_eligible(&self) -> bool {
        matches!(
            self,
            RequestState::New | RequestState::Pending | RequestState::Incomplete
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::New => "NEW",
            RequestState::Pending => "PENDING",
            RequestState::Incomplete => "INCOMPLETE",
            RequestState::Available => "AVAILABLE",
            RequestState::Unavailable => "UNAVAILABLE",
            RequestState::Invalid => "INVALID",
            RequestState::Processed => "PROCESSED",
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked acquisition per distinct remote product identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionRequest {
    /// Provider-assigned product identifier. Primary key, immutable.
    pub id: String,
    /// Current lifecycle state.
    pub state: RequestState,
    /// Resolved product title from provider metadata. Immutable once set;
    /// it is the stable key used for local filename matching.
    pub title: String,
    /// Timestamp of the most recent download attempt.
    pub last_query: Option<DateTime<Utc>>,
}

impl AcquisitionRequest {
    /// Create a fresh record for an id whose metadata lookup just succeeded.
    pub fn new(id: String, title: String) -> Self {
        Self {
            id,
            state: RequestState::New,
            title,
            last_query: None,
        }
    }
}

/// Classified result of one provider download call.
///
/// The scheduler's transition table is total over these variants; the
/// provider boundary never surfaces its own error taxonomy past this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The product archive was downloaded and verified.
    Success,
    /// The archive is offline; the provider started staging it for later
    /// retrieval.
    StagingTriggered,
    /// The provider refused to stage the archive.
    StagingRefused,
    /// Recoverable remote or network fault; worth retrying later.
    TransientError(String),
    /// Non-recoverable server-side fault for this product.
    PermanentServerError(String),
    /// The downloaded content did not match the provider's checksum.
    ChecksumMismatch,
}

/// Product metadata resolved from the provider.
#[derive(Debug, Clone)]
pub struct ProductMetadata {
    pub id: String,
    /// Display and file-naming title, e.g.
    /// `S2A_MSIL1C_20220104T103431_N0301_R108_T32UMA_20220104T123507`.
    pub title: String,
    /// MD5 checksum of the product archive, when the provider publishes one.
    pub checksum_md5: Option<String>,
}

/// Provider credentials supplied per call by the front door.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
