//! `sysrev status --workflow-id <id>`.

use anyhow::Result;
use sysrev::orchestrator::{ResumeResolver, ResumeTarget};
use sysrev::store::{CheckpointStore, CostLedger, ItemStore};
use sysrev::ui::{self, StatusReport};
use sysrev_common::{Actor, Phase, WorkflowId};

use super::super::Cli;

const COUNTED_ACTORS: [Actor; 4] = [Actor::JudgeA, Actor::JudgeB, Actor::Adjudicator, Actor::Final];

pub async fn cmd_status(cli: &Cli, workflow_id: &str) -> Result<()> {
    let resolver = ResumeResolver::new(&cli.data_dir())?;
    let id = WorkflowId::from(workflow_id);
    let resolved = resolver.resolve(ResumeTarget::Id(&id)).await?;
    let store = &resolved.store;

    let mut outcomes = Vec::new();
    for phase in Phase::ALL.into_iter().filter(Phase::is_item_phase) {
        let mut counts = Vec::with_capacity(COUNTED_ACTORS.len());
        for actor in COUNTED_ACTORS {
            counts.push((actor, store.count_outcomes(&id, phase, actor).await?));
        }
        outcomes.push((phase, counts));
    }

    ui::print_status(&StatusReport {
        checkpoints: store.checkpoints(&id).await?,
        costs: store.cost_by_phase(&id).await?,
        outcomes,
        next: resolved.resume_at,
        workflow: resolved.workflow,
    });
    Ok(())
}
