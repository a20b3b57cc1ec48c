//! Shared domain types for the sysrev review pipeline.
//!
//! Everything here is plain data: identifiers, the ordered phase set,
//! per-item outcomes, checkpoints and cost records. Persistence and
//! coordination live in the `sysrev` crate.

pub mod checkpoint;
pub mod cost;
pub mod item;
pub mod phase;
pub mod workflow;

pub use checkpoint::{Checkpoint, CheckpointStatus};
pub use cost::{CostUnit, Usage};
pub use item::{Actor, Decision, Document, Item, ItemOutcome};
pub use phase::Phase;
pub use workflow::{Tier, Workflow, WorkflowId, WorkflowStatus};

use thiserror::Error;

/// Failure to parse one of the string-encoded enums stored on disk.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("unknown decision '{0}'")]
    UnknownDecision(String),

    #[error("unknown actor '{0}'")]
    UnknownActor(String),

    #[error("unknown checkpoint status '{0}'")]
    UnknownCheckpointStatus(String),

    #[error("unknown workflow status '{0}'")]
    UnknownWorkflowStatus(String),
}
