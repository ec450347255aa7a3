use thiserror::Error;

/// Errors surfaced by the scan engine and session.
///
/// Pre-flight variants are returned synchronously from `start_scan`; the
/// rest end a running scan in the `error` state.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("app context is not initialized")]
    NotInitialized,

    #[error("target must not be empty")]
    EmptyTarget,

    #[error("invalid port range {start}-{end}: ports must satisfy 1 <= start <= end <= 65535")]
    InvalidRange { start: u32, end: u32 },

    #[error("max threads must be at least 1")]
    InvalidConcurrency,

    #[error("failed to resolve target {target}: {reason}")]
    Resolve { target: String, reason: String },

    #[error("internal scan failure: {0}")]
    Internal(String),
}

impl ScanError {
    /// True for errors that prevented a scan from starting at all.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            ScanError::NotInitialized
                | ScanError::EmptyTarget
                | ScanError::InvalidRange { .. }
                | ScanError::InvalidConcurrency
        )
    }
}
