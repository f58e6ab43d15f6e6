//! Change feed processor error types

use thiserror::Error;

/// Result type for change feed processor operations
pub type Result<T> = std::result::Result<T, ChangeFeedError>;

/// Change feed processor errors
///
/// The enum is `Clone` because a failure captured by a processor or renewer task
/// is read by its supervisor after the producing task has finished.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChangeFeedError {
    // ==================== Topology Errors ====================
    /// The range owned by a lease no longer exists (split or merge).
    #[error("feed range gone for lease {lease_token}")]
    FeedRangeGone {
        lease_token: String,
        /// Last continuation that was successfully read for this range
        last_continuation: Option<String>,
    },

    /// Raised by the feed reader when the requested range is no longer served
    #[error("partition gone: {0}")]
    PartitionGone(String),

    /// Raised by the feed reader while the requested range is being split
    #[error("partition splitting: {0}")]
    PartitionSplitting(String),

    // ==================== Lease Errors ====================
    #[error("lease lost: {0}")]
    LeaseLost(String),

    #[error("lease not found: {0}")]
    LeaseNotFound(String),

    /// Another call on this host is still acquiring the lease
    #[error("acquisition of lease {0} already in progress")]
    AcquisitionInProgress(String),

    // ==================== Store Errors ====================
    #[error("precondition failed for document {0}")]
    PreconditionFailed(String),

    #[error("document already exists: {0}")]
    Conflict(String),

    #[error("lease store error: {0}")]
    Store(String),

    // ==================== Processing Errors ====================
    #[error("change feed read error: {0}")]
    Read(String),

    #[error("observer error: {0}")]
    Observer(String),

    #[error("partition {lease_token} stalled: no progress for {elapsed_ms}ms")]
    Stalled { lease_token: String, elapsed_ms: u64 },

    // ==================== Configuration Errors ====================
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // ==================== Lifecycle Errors ====================
    #[error("shutdown in progress")]
    ShuttingDown,
}

impl ChangeFeedError {
    /// Feed reader signalled that the range was split or removed
    pub fn is_partition_gone(&self) -> bool {
        matches!(
            self,
            ChangeFeedError::PartitionGone(_) | ChangeFeedError::PartitionSplitting(_)
        )
    }

    /// Ownership of the lease was taken over or the lease disappeared
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            ChangeFeedError::LeaseLost(_) | ChangeFeedError::LeaseNotFound(_)
        )
    }

    /// Check if this error is retriable by the outer acquisition loop
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ChangeFeedError::PreconditionFailed(_)
                | ChangeFeedError::Store(_)
                | ChangeFeedError::Read(_)
                | ChangeFeedError::LeaseLost(_)
                | ChangeFeedError::AcquisitionInProgress(_)
        )
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn observer(msg: impl Into<String>) -> Self {
        Self::Observer(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

impl From<serde_json::Error> for ChangeFeedError {
    fn from(err: serde_json::Error) -> Self {
        ChangeFeedError::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for ChangeFeedError {
    fn from(err: base64::DecodeError) -> Self {
        ChangeFeedError::Serialization(format!("invalid continuation encoding: {}", err))
    }
}
