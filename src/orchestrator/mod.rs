//! The phase state machine and its collaborators.

mod context;
mod engine;
mod phases;
mod resume;
mod state;

pub use context::WorkflowContext;
pub use engine::PhaseOrchestrator;
pub use phases::{InputRecord, REPORT_FILE, SYNTHESIS_FILE, StudyRecord, SynthesisInput, read_input};
pub use resume::{ResolvedWorkflow, ResumeResolver, ResumeTarget, CONFIG_SNAPSHOT, STATE_DB, resume_point};
pub use state::{PhaseEvent, PhaseReport, RunState, RunSummary};
