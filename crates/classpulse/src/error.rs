//! Failure taxonomy for engine operations.
//!
//! Every operation returns [`EngineError`], which keeps three shapes of
//! failure apart: the session does not exist, a domain gate refused the
//! request, or the backing store had an operational problem. Transports map
//! these onto their own status semantics without inspecting strings.

use crate::store::StoreError;

/// A request-level refusal. Recoverable: the caller reports it and moves on,
/// and session state is exactly as it was before the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// No voter token was supplied.
    #[error("missing voter id")]
    MissingVoter,
    /// This voter was already counted in the current round.
    #[error("already voted this round")]
    AlreadyVoted,
    /// The vote window is not open: never started, expired, or the vote
    /// carried a stale round tag.
    #[error("vote window is closed")]
    WindowClosed,
    /// The poll is not accepting votes.
    #[error("poll is not active")]
    NotActive,
    /// Question submissions are currently disabled for the session.
    #[error("question submissions are disabled")]
    PermissionDenied,
    /// Submitted text was empty after trimming.
    #[error("text must not be empty")]
    EmptyText,
    /// The session is locked and takes no new participants.
    #[error("session is locked")]
    SessionLocked,
}

/// Failure of an engine operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No session with the given code.
    #[error("session not found")]
    NotFound,
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// True when the failure is a domain gate rather than an operational
    /// problem.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// The gate that refused the request, if that is what failed.
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Self::Rejected(rejection) => Some(*rejection),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_surfaced_through_engine_errors() {
        let err = EngineError::from(Rejection::AlreadyVoted);
        assert!(err.is_rejection());
        assert_eq!(err.rejection(), Some(Rejection::AlreadyVoted));
        assert_eq!(err.to_string(), "already voted this round");
    }

    #[test]
    fn not_found_is_not_a_rejection() {
        let err = EngineError::NotFound;
        assert!(!err.is_rejection());
        assert_eq!(err.rejection(), None);
    }

    #[test]
    fn store_failures_keep_their_message() {
        let err = EngineError::from(StoreError::Unavailable("connection refused".into()));
        assert!(!err.is_rejection());
        assert_eq!(
            err.to_string(),
            "session store unavailable: connection refused"
        );
    }
}
