//! Run-level state, per-phase reports, and progress events.

use serde::Serialize;
use std::time::Duration;
use sysrev_common::{CheckpointStatus, Decision, Phase, WorkflowId};

/// Where the orchestrator's state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum RunState {
    Phase(Phase),
    /// Terminal: every phase completed, or a drain stopped the run cleanly.
    Done,
    /// Terminal: an error ended the run. The error itself is returned.
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// What one phase run produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub status: CheckpointStatus,
    pub items_processed: u64,
    /// Items decided during this invocation (excludes the skip-set).
    pub newly_processed: u64,
    pub adjudicated: u64,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

/// Result of one `run`/`resume` invocation that did not fail.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub workflow_id: WorkflowId,
    pub phases: Vec<PhaseReport>,
    /// Stopped early because of an operator interrupt.
    pub drained: bool,
    /// Phase a later `resume` will start from; `None` once finalize completed.
    pub resume_at: Option<Phase>,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        self.resume_at.is_none()
    }
}

/// Progress events for renderers. Sending never blocks the run on a slow UI
/// for longer than the channel's capacity.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseEvent {
    PhaseStarted {
        phase: Phase,
        total: u64,
        already_processed: u64,
    },
    ItemCompleted {
        phase: Phase,
        item_id: String,
        decision: Decision,
        adjudicated: bool,
    },
    ItemFailed {
        phase: Phase,
        item_id: String,
        error: String,
    },
    Draining {
        phase: Phase,
    },
    PhaseCompleted {
        report: PhaseReport,
    },
    RunFinished {
        state: RunState,
    },
}

mod duration_ms {
    use serde::{Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!RunState::Phase(Phase::Screening).is_terminal());
        assert!(RunState::Done.is_terminal());
        assert!(RunState::Failed.is_terminal());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = PhaseEvent::RunFinished {
            state: RunState::Phase(Phase::Writing),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run_finished");
        assert_eq!(json["state"]["state"], "phase");
        assert_eq!(json["state"]["phase"], "writing");
    }

    #[test]
    fn test_summary_completion() {
        let summary = RunSummary {
            workflow_id: WorkflowId::from("wf-1"),
            phases: Vec::new(),
            drained: true,
            resume_at: Some(Phase::Screening),
        };
        assert!(!summary.is_complete());
    }
}
