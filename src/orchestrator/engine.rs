use std::sync::Arc;
use std::time::Instant;

use sysrev_common::{CheckpointStatus, Item, Phase, WorkflowStatus};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::context::WorkflowContext;
use super::phases;
use super::state::{PhaseEvent, PhaseReport, RunState, RunSummary};
use crate::consensus::ConsensusEngine;
use crate::errors::{EngineError, StoreError};
use crate::store::{CheckpointStore, CostLedger, ItemStore};

/// Drives a workflow through its phases, one at a time, in phase order.
pub struct PhaseOrchestrator {
    ctx: Arc<WorkflowContext>,
    event_tx: Option<mpsc::Sender<PhaseEvent>>,
}

/// What one worker did with its share of a phase.
#[derive(Default)]
struct WorkerReport {
    decided: u64,
    adjudicated: u64,
    undecided: Vec<String>,
    stopped_early: bool,
}

impl PhaseOrchestrator {
    pub fn new(ctx: WorkflowContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PhaseEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn context(&self) -> &WorkflowContext {
        &self.ctx
    }

    /// Run from `start` until every phase completes, a drain stops the run,
    /// or an error occurs.
    ///
    /// Errors leave the failing phase's checkpoint untouched. A drain writes
    /// `partial` for the interrupted phase and returns `Ok` with
    /// `drained = true`.
    pub async fn run(&self, start: Phase) -> Result<RunSummary, EngineError> {
        let wf = self.ctx.workflow_id().clone();
        self.ensure_predecessors_completed(start).await?;
        self.ctx
            .store
            .set_workflow_status(&wf, WorkflowStatus::Running)
            .await?;

        let mut summary = RunSummary {
            workflow_id: wf.clone(),
            phases: Vec::new(),
            drained: false,
            resume_at: Some(start),
        };
        let mut state = RunState::Phase(start);

        while let RunState::Phase(phase) = state {
            if self.ctx.cancel.is_aborted() {
                return Err(EngineError::Aborted);
            }
            if self.ctx.cancel.should_stop_now() {
                info!(%phase, "Interrupt received, not starting next phase");
                summary.drained = true;
                summary.resume_at = Some(phase);
                state = RunState::Done;
                continue;
            }

            info!(%phase, workflow = %wf, "Entering phase");
            let result = if phase.is_item_phase() {
                self.run_item_phase(phase).await
            } else {
                self.run_step_phase(phase).await
            };

            match result {
                Ok(report) => {
                    info!(
                        %phase,
                        status = %report.status,
                        items = report.items_processed,
                        "Phase finished"
                    );
                    self.emit(PhaseEvent::PhaseCompleted {
                        report: report.clone(),
                    })
                    .await;
                    let partial = report.status == CheckpointStatus::Partial;
                    summary.phases.push(report);
                    if partial {
                        summary.drained = true;
                        summary.resume_at = Some(phase);
                        state = RunState::Done;
                    } else {
                        summary.resume_at = phase.next();
                        state = phase.next().map(RunState::Phase).unwrap_or(RunState::Done);
                    }
                }
                Err(err) => {
                    let err = err.in_phase(phase);
                    if !matches!(err, EngineError::Aborted) {
                        error!(%phase, error = %err, "Phase failed");
                        if let Err(status_err) = self
                            .ctx
                            .store
                            .set_workflow_status(&wf, WorkflowStatus::Failed)
                            .await
                        {
                            warn!(error = %status_err, "Could not record workflow failure");
                        }
                    }
                    self.emit(PhaseEvent::RunFinished {
                        state: RunState::Failed,
                    })
                    .await;
                    return Err(err);
                }
            }
        }

        self.emit(PhaseEvent::RunFinished { state }).await;
        Ok(summary)
    }

    async fn ensure_predecessors_completed(&self, start: Phase) -> Result<(), EngineError> {
        let wf = self.ctx.workflow_id();
        for &earlier in start.predecessors() {
            let completed = self
                .ctx
                .store
                .checkpoint(wf, earlier)
                .await?
                .is_some_and(|cp| cp.is_completed());
            if !completed {
                return Err(EngineError::Consistency(format!(
                    "cannot enter phase {}: phase {} is not completed",
                    start, earlier
                )));
            }
        }
        Ok(())
    }

    async fn run_step_phase(&self, phase: Phase) -> Result<PhaseReport, EngineError> {
        let started = Instant::now();
        self.emit(PhaseEvent::PhaseStarted {
            phase,
            total: 1,
            already_processed: 0,
        })
        .await;

        let items_processed = match phase {
            Phase::Search => phases::ingest(&self.ctx).await?,
            Phase::Synthesis => phases::synthesize(&self.ctx).await?,
            Phase::Writing => phases::write_report(&self.ctx).await?,
            Phase::Finalize => phases::finalize(&self.ctx).await?,
            Phase::Screening | Phase::Extraction => {
                return Err(EngineError::Consistency(format!("{} is an item phase", phase)));
            }
        };

        self.refuse_checkpoint_after_abort(phase)?;
        self.ctx
            .store
            .write_checkpoint(
                self.ctx.workflow_id(),
                phase,
                CheckpointStatus::Completed,
                items_processed,
            )
            .await?;

        Ok(PhaseReport {
            phase,
            status: CheckpointStatus::Completed,
            items_processed,
            newly_processed: items_processed,
            adjudicated: 0,
            duration: started.elapsed(),
        })
    }

    async fn run_item_phase(&self, phase: Phase) -> Result<PhaseReport, EngineError> {
        let started = Instant::now();
        let wf = self.ctx.workflow_id().clone();
        let store = &self.ctx.store;

        let items = store.items(&wf, phase).await?;
        let processed = store.processed_ids(&wf, phase).await?;
        let pending: Vec<Item> = items
            .iter()
            .filter(|item| !processed.contains(&item.id))
            .cloned()
            .collect();

        info!(
            %phase,
            total = items.len(),
            skipped = processed.len(),
            pending = pending.len(),
            "Built skip-set"
        );
        self.emit(PhaseEvent::PhaseStarted {
            phase,
            total: items.len() as u64,
            already_processed: processed.len() as u64,
        })
        .await;

        let concurrency = self
            .ctx
            .config
            .stage(phase)
            .map(|s| s.concurrency)
            .unwrap_or(1)
            .max(1);

        // Fires on hard abort, or when one worker hits an error that ends the phase.
        let phase_cancel = self.ctx.cancel.abort_token().child_token();
        let engine = Arc::new(self.ctx.consensus_engine(phase)?.with_cancel(phase_cancel.clone()));
        let abort = self.ctx.cancel.abort_token();

        let mut set = JoinSet::new();
        for share in partition(pending, concurrency) {
            set.spawn(work_share(
                self.ctx.clone(),
                engine.clone(),
                share,
                phase_cancel.clone(),
                self.event_tx.clone(),
            ));
        }

        let mut combined = WorkerReport::default();
        let mut first_error: Option<EngineError> = None;
        loop {
            let joined = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    set.abort_all();
                    warn!(%phase, "Aborted, leaving checkpoint untouched");
                    return Err(EngineError::Aborted);
                }
                joined = set.join_next() => joined,
            };
            match joined {
                None => break,
                Some(Ok(Ok(report))) => {
                    combined.decided += report.decided;
                    combined.adjudicated += report.adjudicated;
                    combined.undecided.extend(report.undecided);
                    combined.stopped_early |= report.stopped_early;
                }
                Some(Ok(Err(err))) => {
                    if first_error.is_none() {
                        phase_cancel.cancel();
                        first_error = Some(err);
                    }
                }
                Some(Err(join_err)) => {
                    phase_cancel.cancel();
                    first_error
                        .get_or_insert(StoreError::Task(join_err.to_string()).into());
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        if combined.stopped_early {
            self.emit(PhaseEvent::Draining { phase }).await;
        }
        let items_processed = store.processed_ids(&wf, phase).await?.len() as u64;
        let status = if combined.stopped_early {
            CheckpointStatus::Partial
        } else if !combined.undecided.is_empty() {
            combined.undecided.sort();
            return Err(EngineError::PhaseIncomplete {
                phase,
                item_ids: combined.undecided,
            });
        } else {
            if let Some(next) = phase.downstream_item_phase() {
                let accepted = phases::accepted_items(&self.ctx, phase, next).await?;
                let added = store.enqueue_items(&wf, &accepted).await?;
                info!(%phase, %next, added, "Queued accepted items for next phase");
            }
            CheckpointStatus::Completed
        };

        self.refuse_checkpoint_after_abort(phase)?;
        store
            .write_checkpoint(&wf, phase, status, items_processed)
            .await?;

        Ok(PhaseReport {
            phase,
            status,
            items_processed,
            newly_processed: combined.decided,
            adjudicated: combined.adjudicated,
            duration: started.elapsed(),
        })
    }

    /// The abort token is only watched while joining workers; a second
    /// interrupt that lands after that must still block the write.
    fn refuse_checkpoint_after_abort(&self, phase: Phase) -> Result<(), EngineError> {
        if self.ctx.cancel.is_aborted() {
            warn!(%phase, "Aborted before checkpoint, leaving it untouched");
            return Err(EngineError::Aborted);
        }
        Ok(())
    }

    async fn emit(&self, event: PhaseEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

/// Deal items round-robin into at most `workers` disjoint shares.
fn partition(items: Vec<Item>, workers: usize) -> Vec<Vec<Item>> {
    let workers = workers.min(items.len()).max(1);
    let mut shares: Vec<Vec<Item>> = (0..workers).map(|_| Vec::new()).collect();
    for (i, item) in items.into_iter().enumerate() {
        shares[i % workers].push(item);
    }
    shares.retain(|s| !s.is_empty());
    shares
}

async fn work_share(
    ctx: Arc<WorkflowContext>,
    engine: Arc<ConsensusEngine>,
    share: Vec<Item>,
    phase_cancel: CancellationToken,
    event_tx: Option<mpsc::Sender<PhaseEvent>>,
) -> Result<WorkerReport, EngineError> {
    let phase = engine.stage();
    let wf = ctx.workflow_id();
    let budget = ctx.config.budget.max_cost_usd;
    let mut report = WorkerReport::default();

    for item in share {
        if ctx.cancel.should_stop_now() {
            report.stopped_early = true;
            break;
        }
        if phase_cancel.is_cancelled() {
            break;
        }
        if let Some(limit) = budget {
            let spent = ctx.store.total_cost(wf).await?;
            if spent >= limit {
                return Err(EngineError::BudgetExceeded { limit, spent });
            }
        }

        match engine.evaluate(&item).await {
            Ok(result) => {
                report.decided += 1;
                if result.was_adjudicated() {
                    report.adjudicated += 1;
                }
                if let Some(ref tx) = event_tx {
                    tx.send(PhaseEvent::ItemCompleted {
                        phase,
                        item_id: item.id.clone(),
                        decision: result.final_outcome.decision,
                        adjudicated: result.was_adjudicated(),
                    })
                    .await
                    .ok();
                }
            }
            Err(EngineError::TransientCall { item_id, actor, source }) => {
                warn!(%phase, item = %item_id, %actor, error = %source, "Item left undecided");
                if let Some(ref tx) = event_tx {
                    tx.send(PhaseEvent::ItemFailed {
                        phase,
                        item_id: item_id.clone(),
                        error: source.to_string(),
                    })
                    .await
                    .ok();
                }
                report.undecided.push(item_id);
            }
            Err(EngineError::Aborted) => return Err(EngineError::Aborted),
            Err(err) if err.item_id().is_some() => return Err(err),
            Err(err) => {
                return Err(EngineError::PhaseFailed {
                    phase,
                    item_id: Some(item.id.clone()),
                    source: Box::new(err),
                });
            }
        }
    }
    Ok(report)
}
