//! Error types for the presence registry.

use thiserror::Error;

/// Errors surfaced by the registry operations.
///
/// These are contract violations: the transport layer converts them into
/// client-visible protocol errors. Absence of data (no match, no remote
/// state) is never an error.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// An operation referenced a contact id that never registered.
    #[error("no registered self contact found for: {contact_id}")]
    ContactNotRegistered {
        /// The offending contact id.
        contact_id: String,
    },

    /// The operation requires a connection-scoped contact reference.
    #[error("a connection id is required for this operation")]
    MissingConnectionId,

    /// A search predicate carried an invalid regular expression.
    #[error("invalid search expression: {0}")]
    InvalidSearchExpression(#[from] regex::Error),
}

/// Errors returned by backplane providers.
#[derive(Debug, Error)]
pub enum BackplaneError {
    /// The call was cancelled cooperatively (e.g. during shutdown).
    ///
    /// Treated as a non-error by the registry and never logged as a failure.
    #[error("backplane operation cancelled")]
    Cancelled,

    /// The provider is temporarily unable to serve the request.
    #[error("backplane provider unavailable: {0}")]
    Unavailable(String),

    /// Any other provider fault.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackplaneError {
    /// True when this fault is an expected cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackplaneError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_not_logged_as_failure() {
        assert!(BackplaneError::Cancelled.is_cancelled());
        assert!(!BackplaneError::Unavailable("redis down".into()).is_cancelled());
    }

    #[test]
    fn test_not_registered_display() {
        let err = PresenceError::ContactNotRegistered {
            contact_id: "contact1".into(),
        };
        assert_eq!(
            err.to_string(),
            "no registered self contact found for: contact1"
        );
    }
}
