//! Error taxonomy for the delivery layer.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by identity resolution, handshake and event routing.
///
/// The `Display` output is what clients see in the `error` event, so every
/// message is short and free of internal detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// No user record matched the raw identifier in any encoding.
    #[error("User not found")]
    IdentityNotFound(String),

    /// Token missing, malformed, expired or inconsistent with the hint.
    #[error("{0}")]
    InvalidToken(String),

    /// Malformed event.
    #[error("{0}")]
    ValidationFailed(String),

    /// A referenced channel or user does not exist.
    #[error("{0}")]
    ReferenceNotFound(String),

    /// The persistence collaborator failed or timed out.
    #[error("{0}")]
    PersistFailed(String),

    /// A collaborator needed for a non-persisting read is unavailable.
    #[error("{0}")]
    Unavailable(String),

    /// Presence directory failure.
    #[error("Presence directory error: {0}")]
    Presence(String),

    /// Event bus failure.
    #[error("Event bus error: {0}")]
    Bus(String),
}

impl RelayError {
    /// Short machine-friendly label, used for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::IdentityNotFound(_) => "identity_not_found",
            RelayError::InvalidToken(_) => "invalid_token",
            RelayError::ValidationFailed(_) => "validation_failed",
            RelayError::ReferenceNotFound(_) => "reference_not_found",
            RelayError::PersistFailed(_) => "persist_failed",
            RelayError::Unavailable(_) => "unavailable",
            RelayError::Presence(_) => "presence",
            RelayError::Bus(_) => "bus",
        }
    }
}

/// Failures reported by external collaborators (stores, directories).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The collaborator could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its deadline.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The collaborator refused the write.
    #[error("store rejected request: {0}")]
    Rejected(String),
}

/// Run a collaborator call with a deadline.
///
/// # Errors
///
/// Returns the call's own error, or `StoreError::Timeout` when the deadline
/// passes first.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_messages_are_short() {
        assert_eq!(
            RelayError::IdentityNotFound("7".into()).to_string(),
            "User not found"
        );
        assert_eq!(
            RelayError::ReferenceNotFound("Channel doesn't exist".into()).to_string(),
            "Channel doesn't exist"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_elapses() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, StoreError>(1)
        };

        let result = with_deadline(Duration::from_millis(50), slow).await;
        assert_eq!(result, Err(StoreError::Timeout(Duration::from_millis(50))));
    }

    #[tokio::test]
    async fn test_deadline_passes_through() {
        let result = with_deadline(Duration::from_secs(1), async { Ok::<_, StoreError>(5) }).await;
        assert_eq!(result, Ok(5));
    }
}
