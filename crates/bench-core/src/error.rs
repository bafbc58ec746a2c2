use thiserror::Error;

/// Errors returned by a target's submission call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetError {
    /// The target refused the request (underpriced, sequence conflict, out of resources, ...)
    #[error("rejected: {0}")]
    Rejected(String),
    /// The target could not be reached at all
    #[error("unreachable: {0}")]
    Unreachable(String),
}

/// Errors returned by a target's confirmation wait.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfirmError {
    #[error("no confirmation before timeout")]
    TimedOut,
    #[error("tracking failed: {0}")]
    Tracking(String),
}

/// The only error class that aborts a run instead of being tallied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FatalError {
    #[error("failed to fetch starting sequence for {sender}: {reason}")]
    StartingSequence { sender: String, reason: String },
    #[error("target unreachable for {consecutive} consecutive submissions: {last_error}")]
    TargetUnreachable { consecutive: u64, last_error: String },
}

/// Longest reason text kept in the error log.
pub const MAX_REASON_LEN: usize = 100;

/// Truncate an error reason to `MAX_REASON_LEN` characters.
pub fn truncate_reason(reason: &str) -> String {
    match reason.char_indices().nth(MAX_REASON_LEN) {
        Some((idx, _)) => reason[..idx].to_string(),
        None => reason.to_string(),
    }
}
