//! Error types for keel-control.

use std::time::Duration;

use keel_scheduler::SchedulerError;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Job is absent, or not in the state the operation requires.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Deployment not found.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    /// Operation does not apply to the deployment's current status.
    #[error("deployment {id} is {status}, cannot {operation}")]
    InvalidState {
        /// Deployment identifier.
        id: String,
        /// Current status.
        status: &'static str,
        /// Attempted operation.
        operation: &'static str,
    },

    /// Concurrent state-machine collision or duplicate submission.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Retry budget consumed.
    #[error("job {job_id} exhausted after {attempts} attempts")]
    Exhausted {
        /// Job identifier.
        job_id: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Executor exceeded the build deadline.
    #[error("job {job_id} timed out after {after:?}")]
    Timeout {
        /// Job identifier.
        job_id: String,
        /// Deadline that elapsed.
        after: Duration,
    },

    /// Storage temporarily unavailable; the whole operation may be retried.
    #[error("storage temporarily unavailable: {0}")]
    Transient(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Node registry error.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a conflict error.
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if retrying the whole operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Scheduler(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Returns true for the not-found class: absent, or in the wrong state.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::JobNotFound(_) | Self::DeploymentNotFound(_) | Self::InvalidState { .. }
        ) || matches!(self, Self::Scheduler(SchedulerError::NodeNotFound(_)))
    }

    /// Returns true if this is a conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<sqlx::Error> for ControlError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Transient(err.to_string()),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_owned())
            }
            other => Self::Database(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_transient() {
        let err = ControlError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());

        let err = ControlError::from(sqlx::Error::RowNotFound);
        assert!(!err.is_transient());
        assert!(matches!(err, ControlError::Database(_)));
    }

    #[test]
    fn scheduler_transient_propagates() {
        let err = ControlError::from(SchedulerError::Transient("down".into()));
        assert!(err.is_transient());

        let err = ControlError::from(SchedulerError::NodeNotFound("n".into()));
        assert!(err.is_not_found());
    }

    #[test]
    fn classes() {
        assert!(ControlError::conflict("x").is_conflict());
        assert!(ControlError::JobNotFound("j".into()).is_not_found());
        assert!(!ControlError::internal("boom").is_not_found());
    }
}
