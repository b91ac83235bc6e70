use thiserror::Error;

/// Engine error taxonomy. `kind` is the machine-readable side of each
/// variant; the display string carries the human-readable detail.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("inconsistent event: {0}")]
    InconsistentEvent(String),
    #[error("propensity error: {0}")]
    Propensity(String),
    #[error("stoichiometry violation: {0}")]
    Stoichiometry(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

impl SimError {
    pub fn kind(&self) -> &'static str {
        match self {
            SimError::Shape(_) | SimError::InvalidArgument(_) => "invalid_input",
            SimError::InconsistentEvent(_) => "inconsistent_event",
            SimError::Propensity(_) => "propensity_error",
            SimError::Stoichiometry(_) => "stoichiometry_violation",
            SimError::Internal(_) | SimError::ThreadPool(_) => "internal",
        }
    }
}

/// Outcome of a run. Construction problems never get this far (they are
/// `Err` before any stepping); a `Failed` or `Cancelled` run still hands
/// back everything recorded through the last completed observation.
#[derive(Debug)]
pub enum SimStatus {
    Ok,
    Cancelled,
    Failed(SimError),
}

impl SimStatus {
    pub fn code(&self) -> &'static str {
        match self {
            SimStatus::Ok => "ok",
            SimStatus::Cancelled => "cancelled",
            SimStatus::Failed(err) => err.kind(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, SimStatus::Ok)
    }
}
