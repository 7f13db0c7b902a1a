//! Error handling.

use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use ndarray::ShapeError;
use thiserror::Error;
use tokio::sync::AcquireError;
use tracing::{event, Level};

use crate::models::{GageId, MemberIndex};

/// Ensemble evaluation error type
///
/// This type encapsulates the various errors that may occur. Failures local to a single member,
/// reach or gage are normally recovered from and recorded in the run metadata; only the variants
/// that leave the run without a determinate input set surface to the caller.
#[derive(Debug, Error)]
pub enum EnsembleError {
    /// Cache entry exists but fails structural validation
    #[error("cache entry {fingerprint} is corrupt: {reason}")]
    CacheCorruption { fingerprint: String, reason: String },

    /// Cache directory could not be created, listed or cleaned
    #[error("cache directory operation failed on {}", .path.display())]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cache entry could not be persisted
    #[error("failed to write cache entry {fingerprint}")]
    CacheWrite {
        fingerprint: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be read
    #[error("failed to read configuration file {}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error validating the evaluation configuration
    #[error("configuration is not valid")]
    ConfigValidation(#[from] validator::ValidationErrors),

    /// Error decompressing data
    #[error("failed to decompress data")]
    Decompression(#[source] std::io::Error),

    /// The configured time window excludes every time step of the canonical grid
    #[error("time window selects no time steps from the ensemble time grid")]
    EmptyTimeWindow,

    /// A member changed between the scan and a batch load
    #[error("ensemble member {member} changed on disk during the run ({})", .path.display())]
    InputChanged { member: MemberIndex, path: PathBuf },

    /// Input files could not be enumerated
    #[error("failed to enumerate ensemble inputs in {}", .path.display())]
    InputEnumeration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Insufficient memory to process a single reach
    #[error("Insufficient memory to process a reach ({requested} > {total})")]
    InsufficientMemory { requested: usize, total: usize },

    /// Input file name pattern could not be compiled
    #[error("invalid input file pattern {pattern}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Invalid missing data descriptor
    #[error("missing data descriptor is not valid")]
    InvalidMissing(#[from] validator::ValidationError),

    /// Quantile outside the open interval (0, 1)
    #[error("invalid quantile {0}: must lie strictly between 0 and 1")]
    InvalidQuantile(f64),

    /// Time grid of a member differs from the canonical grid
    #[error("ensemble member {member} time grid differs from the canonical grid: {reason}")]
    MemberMismatch { member: MemberIndex, reason: String },

    /// A member file could not be parsed
    #[error("failed to parse ensemble member {member} ({}): {reason}", .path.display())]
    MemberParse {
        member: MemberIndex,
        path: PathBuf,
        reason: String,
    },

    /// Input selection matched nothing
    #[error("no ensemble member files matched {selection}")]
    NoInputFiles { selection: String },

    /// Every member was skipped
    #[error("no ensemble member could be loaded ({skipped} skipped)")]
    NoValidMembers { skipped: usize },

    /// Observation response could not be interpreted
    #[error("observation response for gage {gage} is not valid: {reason}")]
    ObservationFormat { gage: GageId, reason: String },

    /// Error while sending an observation request
    #[error("observation request for gage {gage} failed")]
    ObservationRequest {
        gage: GageId,
        #[source]
        source: reqwest::Error,
    },

    /// Observation service answered with a non-success status
    #[error("observation service returned status {status} for gage {gage}")]
    ObservationStatus { gage: GageId, status: u16 },

    /// A single observation attempt ran past its deadline
    #[error("observation request for gage {gage} timed out after {timeout:?}")]
    ObservationTimeout { gage: GageId, timeout: Duration },

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquireError(#[from] AcquireError),

    /// Error (de)serialising JSON
    #[error("failed to (de)serialise JSON")]
    Serialisation(#[from] serde_json::Error),

    /// Error creating ndarray Array from Shape
    #[error("failed to create array from shape")]
    ShapeInvalid(#[from] ShapeError),

    /// A background statistics task panicked or was cancelled
    #[error("statistics task failed")]
    TaskFailed(#[from] tokio::task::JoinError),

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),
}

impl EnsembleError {
    /// Whether an observation failure may succeed if retried.
    ///
    /// Timeouts, connection failures, throttling and server errors are transient. Client errors
    /// and malformed responses will fail again, so they go straight to the cache fallback.
    pub fn is_transient(&self) -> bool {
        match self {
            EnsembleError::ObservationTimeout { .. } => true,
            EnsembleError::ObservationRequest { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            EnsembleError::ObservationStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Returns the messages of the error's source chain, with adjacent duplicates removed.
pub fn error_chain<E>(error: &E) -> Vec<String>
where
    E: Error + ?Sized,
{
    let mut causes = Vec::new();
    let mut current = error.source();
    while let Some(source) = current {
        causes.push(source.to_string());
        current = source.source();
    }
    causes.dedup();
    causes
}

/// Log an error and its causes.
///
/// Recoverable errors are logged as warnings, the rest as errors.
pub fn log_error(error: &EnsembleError, recovered: bool) {
    if recovered {
        event!(Level::WARN, "{}", error);
        for cause in error_chain(error) {
            event!(Level::WARN, "Caused by: {}", cause);
        }
    } else {
        event!(Level::ERROR, "{}", error);
        for cause in error_chain(error) {
            event!(Level::ERROR, "Caused by: {}", cause);
        }
    }
}
