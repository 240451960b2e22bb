//! Error currency shared by the callback boundary, the container and the engine.

use std::fmt;

/// Opaque error a hook body returns, preserved without requiring hooks to know
/// about [`EngineError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that cross the register/start/stop/tick/tock/listener boundary.
///
/// Kept as one enum (rather than per-hook error types) because the container
/// needs to pattern-match on the sentinel variants -- `ServiceTerminated` in
/// particular gates whether a retry is allowed at all -- while still letting
/// hook bodies bubble up arbitrary errors through `Callback`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine has moved past `running` and no longer accepts new work.
    #[error("engine stopped")]
    EngineStopped,

    /// Returned by a hook to signal the service is done for good and must
    /// not be retried, regardless of its retry policy.
    #[error("service terminated")]
    ServiceTerminated,

    /// The container was already stopped when the operation was attempted.
    #[error("service stopped")]
    ServiceStopped,

    /// Retry budget exhausted; the container has moved to quarantine.
    #[error("max retries reached")]
    MaxRetriesReached,

    /// `start` was cancelled before the loader timeout elapsed.
    #[error("start cancelled")]
    StartCancelled,

    /// A loader bundle never reached `ready` before its timeout.
    #[error("loader timed out waiting for: {0}")]
    LoaderTimeout(String),

    /// A service definition failed validation at registration time.
    #[error("invalid service definition: {0}")]
    InvalidDefinition(String),

    /// The exclusive per-service lock could not be acquired within the
    /// escalation window and the container was force-shut-down instead.
    #[error("lock acquisition failed, service force-shut-down")]
    LockTimeout,

    /// A tick/tock/listener callback panicked; the panic payload, if a
    /// string, is carried as the message.
    #[error("callback panicked: {0}")]
    Panicked(String),

    /// Anything a hook body itself returned.
    #[error(transparent)]
    Callback(#[from] BoxError),
}

impl EngineError {
    /// `true` for sentinels that must never be retried no matter the policy.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineError::ServiceTerminated | EngineError::EngineStopped
        )
    }

    pub fn callback(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        EngineError::Callback(Box::new(err))
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// A cheap string clone of an [`EngineError`] for storage in [`crate::info::ServiceInfo`],
/// which must stay `Clone` without requiring every hook error to be `Clone`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord(pub String);

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&EngineError> for ErrorRecord {
    fn from(err: &EngineError) -> Self {
        ErrorRecord(err.to_string())
    }
}
