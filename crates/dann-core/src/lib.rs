//! # DANN Core
//!
//! Core types and errors for the DANN distributed vector index.
//!
//! This crate provides the fundamental building blocks shared by the index
//! and cluster layers:
//! - [`VectorId`] - Type-safe vector identifier
//! - [`IndexOperation`] - Replicated mutation records
//! - [`VectorClock`] - Causality tracking for eventual consistency
//! - [`QueryRequest`] / [`QueryResponse`] - The query surface
//! - [`DannError`] - The unified error type

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod clock;
mod types;

pub use clock::VectorClock;
pub use types::{
    BulkLoadRequest, ConsistencyLevel, IndexOperation, IndexType, NodeInfo, OperationKind,
    QueryRequest, QueryResponse, SearchResult,
};

// =============================================================================
// Identifiers
// =============================================================================

/// A unique identifier for a vector in the index.
///
/// Uses a newtype pattern to prevent mixing up vector ids with other integer
/// types. Negative values are reserved by the underlying engines as "not
/// found" sentinels and never appear in results returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct VectorId(pub i64);

impl VectorId {
    /// Creates a new VectorId from an i64.
    #[inline]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw i64 value.
    #[inline]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns true if this id is a valid user-facing id (non-negative).
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for VectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for VectorId {
    #[inline]
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by the DANN core.
///
/// Every public operation returns `Result<T, DannError>`; booleans appear
/// only inside the RPC response shapes.
#[derive(Debug, Error)]
pub enum DannError {
    /// Malformed input: dimension mismatch, empty input, unknown load id, ...
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Vector id absent for remove/update.
    #[error("vector {0} not found")]
    NotFound(VectorId),

    /// Concurrent mutations detected before resolution.
    #[error("conflicting mutations for vector {0}")]
    Conflict(VectorId),

    /// IVF search issued before the index was built.
    #[error("index is not trained")]
    NotTrained,

    /// Query or load exceeded its budget.
    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    /// Remote failure, retryable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Caller aborted the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Unexpected invariant break. Fails the operation but must not poison
    /// other operations.
    #[error("internal error: {0}")]
    Internal(String),

    /// Filesystem failure during save/load.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An index file that cannot be understood.
    #[error("corrupt index file: {0}")]
    Corrupt(String),
}

impl DannError {
    /// BadRequest with the canonical dimension-mismatch message.
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        DannError::BadRequest(format!(
            "dimension mismatch: expected {expected}, got {actual}"
        ))
    }

    /// Returns true if the error is retryable.
    pub fn is_transient(&self) -> bool {
        matches!(self, DannError::Transient(_) | DannError::Timeout(_))
    }
}

/// Result type for DANN operations.
pub type Result<T> = std::result::Result<T, DannError>;

// =============================================================================
// Time
// =============================================================================

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
