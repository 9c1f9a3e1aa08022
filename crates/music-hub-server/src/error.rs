//! Engine error taxonomy.
//!
//! Every failure surfaced to controllers carries a stable snake_case code;
//! `Display` renders `"<code>: <detail>"`, which is what ends up in
//! `ControlResponse.reason`.

use thiserror::Error;

use crate::asset_store::StoreError;
use crate::transport::TransportError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Resolver produced no usable result.
    #[error("resolution_failed: {0}")]
    ResolutionFailed(String),
    /// A live track with this source id already exists.
    #[error("duplicate_source_id: {0}")]
    DuplicateSourceId(String),
    /// Moving or deleting an asset file failed.
    #[error("storage_failed: {0}")]
    StorageFailed(String),
    /// Queued track's file is gone.
    #[error("file_missing: {0}")]
    FileMissing(String),
    /// Transport could not establish a connection.
    #[error("connection_failed: {0}")]
    ConnectionFailed(String),
    /// Connection dropped and did not come back in time.
    #[error("connection_lost: {0}")]
    ConnectionLost(String),
    /// No session exists for the tenant.
    #[error("not_ready: {0}")]
    NotReady(String),
    /// Command is not valid in the session's current state.
    #[error("invalid_state: {0}")]
    InvalidState(String),
    /// Missing or malformed control arguments.
    #[error("bad_request: {0}")]
    BadRequest(String),
    /// Acquisition finished after the session was stopped or left.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// Asset store failure.
    #[error("persistence: {0}")]
    Persistence(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ResolutionFailed(_) => "resolution_failed",
            EngineError::DuplicateSourceId(_) => "duplicate_source_id",
            EngineError::StorageFailed(_) => "storage_failed",
            EngineError::FileMissing(_) => "file_missing",
            EngineError::ConnectionFailed(_) => "connection_failed",
            EngineError::ConnectionLost(_) => "connection_lost",
            EngineError::NotReady(_) => "not_ready",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::BadRequest(_) => "bad_request",
            EngineError::Cancelled(_) => "cancelled",
            EngineError::Persistence(_) => "persistence",
        }
    }

    pub(crate) fn no_session(tenant_id: &str) -> Self {
        EngineError::NotReady(format!("no active session for tenant {tenant_id}"))
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateSourceId(source_id) => EngineError::DuplicateSourceId(source_id),
            other => EngineError::Persistence(other.to_string()),
        }
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unreachable(msg) | TransportError::InvalidTarget(msg) => {
                EngineError::ConnectionFailed(msg)
            }
            TransportError::Closed => EngineError::ConnectionLost("connection closed".to_string()),
            TransportError::Command(msg) => EngineError::ConnectionFailed(msg),
        }
    }
}
