//! Typed error hierarchy for the review engine.
//!
//! Four leaf enums cover the subsystems that can fail:
//! - `JudgeError` — one call to the external judgment service
//! - `StoreError` — durable reads and writes
//! - `RateLimitError` — waiting for a tier ticket
//! - `ConfigError` — loading and validating the run configuration
//!
//! `EngineError` is the taxonomy the orchestrator propagates and the CLI maps
//! to exit codes.

use std::path::PathBuf;
use std::time::Duration;

use sysrev_common::{Actor, ParseError, Phase, Tier};
use thiserror::Error;

/// Failure of a single judgment call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JudgeError {
    #[error("judgment call timed out after {0:?}")]
    Timeout(Duration),

    #[error("judgment service throttled the call: {0}")]
    Throttled(String),

    #[error("judgment service returned an unusable response: {0}")]
    InvalidResponse(String),

    #[error("judgment call rejected: {0}")]
    Fatal(String),
}

impl JudgeError {
    /// Timeouts, throttling and garbled output are worth another attempt;
    /// a rejected request is not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Errors from the SQLite-backed stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to prepare storage at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Write failed after {attempts} attempts: {source}")]
    WriteExhausted {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Checkpoint for phase {phase} is completed and cannot regress to partial")]
    CheckpointRegression { phase: Phase },

    #[error("Stored value could not be decoded: {0}")]
    Decode(String),

    #[error("Outcome table {0} is missing")]
    MissingTable(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database task failed: {0}")]
    Task(String),
}

impl From<ParseError> for StoreError {
    fn from(err: ParseError) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RateLimitError {
    #[error("No rate limit configured for tier '{0}'")]
    UnknownTier(Tier),

    #[error("Cancelled while waiting for a '{0}' ticket")]
    Cancelled(Tier),
}

/// Invalid or unreadable configuration. Always raised before any phase runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("Invalid config field '{field}': {message}")]
    Invalid { field: String, message: String },

    #[error("Failed to read input file {path}: {message}")]
    Input { path: PathBuf, message: String },
}

impl ConfigError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Errors propagated by the orchestrator.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Judgment service failure on item {item_id} ({actor}): {source}")]
    TransientCall {
        item_id: String,
        actor: Actor,
        #[source]
        source: JudgeError,
    },

    #[error("Non-retryable judgment failure on item {item_id} ({actor}): {source}")]
    FatalCall {
        item_id: String,
        actor: Actor,
        #[source]
        source: JudgeError,
    },

    #[error("Persistence failure: {0}")]
    Persistence(#[source] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Cost budget of ${limit:.2} reached (spent ${spent:.2})")]
    BudgetExceeded { limit: f64, spent: f64 },

    #[error("{} item(s) could not be decided in phase {phase}: {}", item_ids.len(), item_ids.join(", "))]
    PhaseIncomplete { phase: Phase, item_ids: Vec<String> },

    #[error("Aborted by second interrupt")]
    Aborted,

    #[error("Phase {phase} failed{}: {source}", item_id.as_ref().map(|i| format!(" on item {}", i)).unwrap_or_default())]
    PhaseFailed {
        phase: Phase,
        item_id: Option<String>,
        #[source]
        source: Box<EngineError>,
    },
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Decode(_)
            | StoreError::MissingTable(_)
            | StoreError::CheckpointRegression { .. } => Self::Consistency(err.to_string()),
            other => Self::Persistence(other),
        }
    }
}

impl From<RateLimitError> for EngineError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Cancelled(_) => Self::Aborted,
            RateLimitError::UnknownTier(_) => Self::Consistency(err.to_string()),
        }
    }
}

impl EngineError {
    /// Attach the failing phase (and item, when one is known).
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            already @ Self::PhaseFailed { .. } => already,
            Self::Aborted => Self::Aborted,
            other => {
                let item_id = other.item_id().map(str::to_string);
                Self::PhaseFailed {
                    phase,
                    item_id,
                    source: Box::new(other),
                }
            }
        }
    }

    pub fn item_id(&self) -> Option<&str> {
        match self {
            Self::TransientCall { item_id, .. } | Self::FatalCall { item_id, .. } => Some(item_id),
            Self::PhaseFailed { item_id, .. } => item_id.as_deref(),
            _ => None,
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::PhaseFailed { phase, .. } | Self::PhaseIncomplete { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// The innermost error, looking through phase attribution.
    pub fn root(&self) -> &EngineError {
        match self {
            Self::PhaseFailed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self.root(), Self::Config(_))
    }

    /// Process exit code: 2 for configuration problems, 1 for everything else.
    pub fn exit_code(&self) -> u8 {
        if self.is_config() { 2 } else { 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn judge_error_retryability() {
        assert!(JudgeError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(JudgeError::Throttled("429".into()).is_retryable());
        assert!(JudgeError::InvalidResponse("no json".into()).is_retryable());
        assert!(!JudgeError::Fatal("bad request".into()).is_retryable());
    }

    #[test]
    fn decode_errors_become_consistency_errors() {
        let err: EngineError = StoreError::from(ParseError::UnknownPhase("meta".into())).into();
        assert!(matches!(err, EngineError::Consistency(ref m) if m.contains("meta")));

        let err: EngineError = StoreError::MissingTable("outcomes_screening".into()).into();
        assert!(matches!(err, EngineError::Consistency(_)));
    }

    #[test]
    fn write_failures_stay_persistence_errors() {
        let err: EngineError = StoreError::LockPoisoned.into();
        assert!(matches!(err, EngineError::Persistence(StoreError::LockPoisoned)));
    }

    #[test]
    fn in_phase_carries_item_and_keeps_root() {
        let err = EngineError::FatalCall {
            item_id: "paper-7".into(),
            actor: Actor::JudgeB,
            source: JudgeError::Fatal("malformed".into()),
        }
        .in_phase(Phase::Screening);

        assert_eq!(err.phase(), Some(Phase::Screening));
        assert_eq!(err.item_id(), Some("paper-7"));
        assert!(matches!(err.root(), EngineError::FatalCall { .. }));
        assert!(err.to_string().contains("on item paper-7"));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn aborted_is_never_wrapped() {
        let err = EngineError::Aborted.in_phase(Phase::Extraction);
        assert!(matches!(err, EngineError::Aborted));
    }

    #[test]
    fn config_errors_exit_with_two() {
        let err = EngineError::from(ConfigError::invalid("screening.include_threshold", "must be in [0, 1]"));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.in_phase(Phase::Search).exit_code(), 2);
    }

    #[test]
    fn cancelled_reservation_maps_to_abort() {
        let err: EngineError = RateLimitError::Cancelled(Tier::new("bulk")).into();
        assert!(matches!(err, EngineError::Aborted));
    }
}
