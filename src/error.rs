use thiserror::Error;

/// Crate-wide error type for the durability core.
///
/// Variants map onto the error kinds from the component design: `Io` and `Corrupt` cover storage
/// faults, `NoBaseline`/`BrokenChain` are chain-walk invariant violations, `LockBusy`/`Conflict`
/// come from the conflict/lock manager, `NoSuitablePoint` is a recovery selection failure, and
/// `IntegrityViolation` is audit-chain tamper detection.
#[derive(Error, Debug)]
pub enum DurabilityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record corrupt: {0}")]
    Corrupt(String),

    #[error("no baseline for session {0}")]
    NoBaseline(String),

    #[error("broken chain for session {0}: {1}")]
    BrokenChain(String, String),

    #[error("resource busy: {0}")]
    LockBusy(String),

    #[error("operation conflict: {0}")]
    Conflict(String),

    #[error("no suitable recovery point: {0}")]
    NoSuitablePoint(String),

    #[error("audit integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cycle detected in state tree at {0}")]
    CycleDetected(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DurabilityError>;
