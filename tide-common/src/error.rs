//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in riptide.
pub type DcpResult<T> = Result<T, DcpError>;

/// Status outcomes surfaced across the DCP engine boundary.
///
/// Flow-control exhaustion and empty ready queues surface as `WouldBlock` (non-fatal, the
/// front-end parks the connection). Memory pressure surfaces as `TempFail` on the consumer.
/// Unrecoverable protocol violations escalate to `Disconnect`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DcpError {
    /// No progress is possible right now; the caller should park and retry after a notification.
    #[error("operation would block")]
    WouldBlock,

    /// Operation failed for an unclassified engine-internal reason.
    #[error("operation failed: {0}")]
    Failed(&'static str),

    /// Caller supplied an argument the engine rejects.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transient resource shortage; the caller may retry the same operation later.
    #[error("temporary failure: {0}")]
    TempFail(&'static str),

    /// The message does not fit the transport's size budget.
    #[error("message too big")]
    TooBig,

    /// The connection must be torn down.
    #[error("connection must disconnect: {0}")]
    Disconnect(&'static str),

    /// The requested feature is not supported by this build or negotiation state.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Wire payload is malformed or semantically invalid.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

impl DcpError {
    /// Returns whether this error parks the connection rather than failing it.
    #[must_use]
    pub const fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::DcpError;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn would_block_is_the_only_parking_error() {
        assert_that!(DcpError::WouldBlock.is_would_block(), eq(true));
        assert_that!(DcpError::TooBig.is_would_block(), eq(false));
        assert_that!(
            DcpError::TempFail("throttled").is_would_block(),
            eq(false)
        );
    }

    #[rstest]
    fn error_messages_carry_context() {
        let error = DcpError::InvalidArgument("unknown control key 'frobnicate'".to_owned());
        assert_that!(
            format!("{error}").contains("unknown control key"),
            eq(true)
        );
    }
}
