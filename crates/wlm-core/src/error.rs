//! Unified error types for the WLM ecosystem
//!
//! This module provides a common error type [`WlmError`] that can represent
//! errors from any part of the system. Domain-specific failures (parsing,
//! simulation, localization) convert to `WlmError` so boundaries such as an
//! HTTP host can map error kinds uniformly.
//!
//! # Example
//!
//! ```ignore
//! use wlm_core::{WlmError, WlmResult};
//!
//! fn import_network(path: &str) -> WlmResult<()> {
//!     let document = parse_inp(path)?;
//!     persist(document)?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Unified error type for all WLM operations.
///
/// The variants mirror the failure kinds callers are expected to branch on:
/// bad requests, missing entities, uniqueness conflicts, broken structural
/// invariants, and the simulator/localization failure modes.
#[derive(Error, Debug)]
pub enum WlmError {
    /// Malformed or out-of-range caller input; never retried
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An entity referenced by id or label does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness invariant (label, mainline, matrix key) was violated
    #[error("conflict: {0}")]
    Conflict(String),

    /// A structural invariant does not hold (e.g. cycle in the parent graph)
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The hydraulic engine could not be brought up after retries
    #[error("simulator unavailable: {0}")]
    SimulatorUnavailable(String),

    /// A steady-state solve failed or timed out
    #[error("simulation failed: {0}")]
    SimulationFailed(String),

    /// Every sensor read from a solve came back NaN or infinite
    #[error("no valid readings: {0}")]
    NoValidReadings(String),

    /// Localization could not single out a candidate
    #[error("localization undetermined: {0}")]
    LocalizationUndetermined(String),

    /// I/O errors (file access, storage directory, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors (for wrapping external errors)
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using WlmError.
pub type WlmResult<T> = Result<T, WlmError>;

// Conversion from anyhow::Error
impl From<anyhow::Error> for WlmError {
    fn from(err: anyhow::Error) -> Self {
        WlmError::Other(err.to_string())
    }
}

// Conversion from string-like types for convenience
impl From<String> for WlmError {
    fn from(s: String) -> Self {
        WlmError::Other(s)
    }
}

impl From<&str> for WlmError {
    fn from(s: &str) -> Self {
        WlmError::Other(s.to_string())
    }
}

// JSON parsing errors
impl From<serde_json::Error> for WlmError {
    fn from(err: serde_json::Error) -> Self {
        WlmError::InvalidInput(err.to_string())
    }
}
