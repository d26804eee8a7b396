//! Unified error type for the specmem instance — maps internal errors to JSON-RPC codes.

use thiserror::Error;

/// Standard JSON-RPC 2.0 error codes.
const PARSE_ERROR: i32 = -32700;
const INVALID_PARAMS: i32 = -32602;
const METHOD_NOT_FOUND: i32 = -32601;
const INTERNAL_ERROR: i32 = -32603;
/// Application-level server error band (implementation-defined, per JSON-RPC 2.0).
const SERVER_ERROR: i32 = -32000;
const LIFECYCLE_ERROR: i32 = -32001;
const NOT_FOUND: i32 = -32002;

#[derive(Error, Debug)]
pub enum SpecmemError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    // --- Configuration / setup: fail-stop for writes, reads may degrade ---
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Project environment unusable: {0}")]
    EnvironmentUnusable(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    // --- Lifecycle: handled entirely by the Startup Coordinator (C2) ---
    #[error("Another instance is already starting up for this project")]
    ConcurrentStartup,

    #[error("Lost ownership of the instance lock")]
    InstanceLockLost,

    // --- Broker (C4) transient + contract-violation taxonomy ---
    #[error(transparent)]
    Broker(#[from] crate::broker::BrokerError),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SpecmemError {
    /// JSON-RPC error code for this error variant.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::ParseError(_) => PARSE_ERROR,
            Self::InvalidParams(_) | Self::ValidationFailed(_) => INVALID_PARAMS,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::NotFound(_) => NOT_FOUND,
            Self::ConcurrentStartup | Self::InstanceLockLost => LIFECYCLE_ERROR,
            Self::StorageUnavailable(_)
            | Self::EnvironmentUnusable(_)
            | Self::DimensionMismatch { .. }
            | Self::Broker(_)
            | Self::Storage(_)
            | Self::Migration(_) => SERVER_ERROR,
            Self::Io(_) => SERVER_ERROR,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// Convert to a (code, message) pair for `DaemonResponse::error`.
    pub fn into_rpc(self) -> (i32, String) {
        let code = self.rpc_code();
        (code, self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SpecmemError>;
