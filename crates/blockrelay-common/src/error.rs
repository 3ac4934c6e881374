//! Error types for BlockRelay
//!
//! One error enum covers every client-visible failure of the proxy. The
//! completion translator maps physical-service statuses onto these variants;
//! the write engine and directory produce them directly.

use crate::types::Lba;
use thiserror::Error;

/// Common result type for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Client-visible error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Bad slot index, empty buffer, zero length, or mismatched sizes.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The slot has no physical object yet, or geometry negotiation failed.
    #[error("device not ready")]
    NotReady,

    /// A bounded buffer or scatter-list pool was empty.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The physical-service call did not complete within the I/O timeout.
    #[error("I/O timed out")]
    Timeout,

    /// The request was aborted before completion.
    #[error("request canceled")]
    Canceled,

    /// The media reported an unrecoverable error.
    #[error("media error{}", fmt_lba(.lba))]
    MediaError {
        /// Affected LBA, when the service reported one.
        lba: Option<Lba>,
    },

    /// Generic transport or service failure.
    #[error("I/O failed")]
    IoFailed,

    /// The service rejected the operation shape.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

fn fmt_lba(lba: &Option<Lba>) -> String {
    lba.map_or_else(String::new, |lba| format!(" at lba {lba}"))
}
