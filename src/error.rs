//! Error taxonomy for the staple lifecycle engine.
//!
//! Each module-local enum maps to the kinds named in the error handling
//! design: network failures are recovered by retry inside `ocsp`, chain
//! and protocol failures are terminal for the current record and
//! surface up to the orchestrator.

use std::path::PathBuf;
use thiserror::Error;

/// Failures from reading, parsing, or building a request for a
/// certificate record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to read certificate file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no end-entity certificate found in {0}")]
    NoEndEntity(PathBuf),
    #[error("no intermediate certificates found in {0}")]
    NoIntermediates(PathBuf),
    #[error("malformed certificate block in {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("precondition not met: {0}")]
    Precondition(String),
}

/// Chain/path validation failures (§4.3 taxonomy).
#[derive(Debug, Error, Clone)]
pub enum ChainError {
    #[error("path building failed: {0}")]
    PathBuilding(String),
    #[error("path validation failed: {0}")]
    PathValidation(String),
    #[error("certificate revoked: {0}")]
    Revoked(String),
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
}

/// Failures from the staple acquisition protocol (§4.2, §7).
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("network error contacting responder: {0}")]
    Network(String),
    #[error("ocsp responder returned an empty response body")]
    Empty,
    #[error("certificate revoked by responder")]
    Revoked,
    #[error("no responder URL returned a usable response")]
    Exhausted,
    #[error("malformed ocsp response: {0}")]
    Protocol(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Scheduler misuse (programming errors, never recovered locally).
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("queue \"{0}\" is already registered")]
    DuplicateQueue(String),
    #[error("queue \"{0}\" does not exist")]
    UnknownQueue(String),
    #[error("context was never attached to a scheduler")]
    NotAttached,
    #[error("queue \"{0}\" produced no task within the timeout")]
    QueueEmpty(String),
}
