//! Error types for the scheduler.

use thiserror::Error;

/// Scheduler errors.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// An illegal state transition was attempted. Nothing was mutated.
    #[error("invalid {entity} transition: cannot {action} from {from}")]
    StateTransition {
        /// Kind of row the transition targeted.
        entity: &'static str,
        /// State the row was in.
        from: String,
        /// Requested action.
        action: &'static str,
    },

    /// A job cannot be finished with an undetermined outcome.
    #[error("job {0} cannot finish with health Unknown")]
    InvalidHealth(u64),

    /// Device not found.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Device type not found.
    #[error("device type not found: {0}")]
    DeviceTypeNotFound(String),

    /// Worker not found.
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    /// Test job not found.
    #[error("test job not found: {0}")]
    JobNotFound(u64),

    /// Job definition could not be parsed or rewritten.
    #[error("job definition error: {0}")]
    Definition(#[from] serde_yaml::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Backing store error.
    #[error("store error: {0}")]
    Store(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Builds a state transition error for the given row kind.
    #[must_use]
    pub fn transition(entity: &'static str, from: impl ToString, action: &'static str) -> Self {
        Self::StateTransition {
            entity,
            from: from.to_string(),
            action,
        }
    }

    /// Create a store error.
    #[must_use]
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Returns true for illegal transition attempts.
    #[must_use]
    pub const fn is_transition(&self) -> bool {
        matches!(self, Self::StateTransition { .. })
    }
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
