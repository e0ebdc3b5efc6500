//! Error taxonomy for coordinator operations.
//!
//! These are the errors a caller can see synchronously. Failures of
//! asynchronous, hardware-origin work (connect outcomes, read results,
//! notification payload errors) are never raised here once a call has been
//! accepted; they travel as failure payloads on the relevant event stream.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// `initialize` was called while a stack handle already exists.
    #[error("coordinator is already initialized")]
    AlreadyInitialized,

    /// An operation requiring a stack handle was called before `initialize`
    /// (or after `deinitialize`).
    #[error("coordinator is not initialized")]
    NotInitialized,

    /// A malformed or missing identifier or required field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Protocol-sequencing violation, e.g. a subscriber started consuming
    /// scan results before a scan was configured.
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),

    /// An underlying stack error with no finer classification.
    #[error("{0}")]
    Unknown(String),
}
