use thiserror::Error;

use super::mutation::RollbackOutcome;

/// Why a `mutate` call failed. Both variants carry the caller's own error.
#[derive(Debug, Error)]
pub enum MutationError<E> {
    /// The optimistic transform failed; the cache was not touched.
    #[error("optimistic transform failed: {0}")]
    Transform(#[source] E),
    /// The remote write failed; `rollback` records what happened to the cache.
    #[error("remote write failed: {source}")]
    RemoteWrite {
        #[source]
        source: E,
        rollback: RollbackOutcome,
    },
}

impl<E> MutationError<E> {
    /// The error raised by the transform or the remote write.
    pub fn source_error(&self) -> &E {
        match self {
            Self::Transform(source) | Self::RemoteWrite { source, .. } => source,
        }
    }

    pub fn into_source(self) -> E {
        match self {
            Self::Transform(source) | Self::RemoteWrite { source, .. } => source,
        }
    }

    /// Rollback outcome, present only for remote write failures.
    pub fn rollback(&self) -> Option<RollbackOutcome> {
        match self {
            Self::Transform(_) => None,
            Self::RemoteWrite { rollback, .. } => Some(*rollback),
        }
    }

    pub fn is_transform(&self) -> bool {
        matches!(self, Self::Transform(_))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;
    use crate::remote::RemoteError;

    #[test]
    fn remote_write_error_exposes_original() {
        let error = MutationError::RemoteWrite {
            source: RemoteError::from_status(500, "boom"),
            rollback: RollbackOutcome::Restored { version: 3 },
        };

        assert_eq!(error.source_error().status, Some(500));
        assert!(error.source().is_some());
        assert_eq!(
            error.rollback(),
            Some(RollbackOutcome::Restored { version: 3 })
        );
        assert!(!error.is_transform());
        assert!(error.to_string().starts_with("remote write failed"));
    }

    #[test]
    fn transform_error_has_no_rollback() {
        let error = MutationError::Transform(RemoteError::validation("name is required"));
        assert!(error.is_transform());
        assert_eq!(error.rollback(), None);
        assert_eq!(error.into_source().message, "name is required");
    }
}
