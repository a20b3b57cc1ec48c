//! `sysrev run <config>` and `sysrev resume --workflow-id <id>`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use sysrev::cancel::CancellationController;
use sysrev::config::ReviewConfig;
use sysrev::errors::EngineError;
use sysrev::judge::CommandJudge;
use sysrev::orchestrator::{
    PhaseOrchestrator, ResolvedWorkflow, ResumeResolver, ResumeTarget, WorkflowContext,
};
use sysrev::telemetry;
use sysrev::ui::{self, RunProgress};
use sysrev_common::WorkflowId;

use super::super::Cli;
use super::{LOG_DIR, absolute_dir, resume_command};

const EVENT_BUFFER: usize = 256;

pub async fn cmd_run(cli: &Cli, config_path: &Path) -> Result<()> {
    let mut config = ReviewConfig::load(config_path).map_err(EngineError::from)?;
    if let Some(dir) = &cli.data_dir {
        // Relative to the shell, as for `resume` and `status`.
        config.set_data_dir(absolute_dir(dir));
    }
    let data_dir = config.data_dir();
    let _guard = telemetry::init(&cli.log_options(), Some(&data_dir.join(LOG_DIR)));

    let resolver = ResumeResolver::new(&data_dir)?;
    let resolved = resolver.resolve(ResumeTarget::Config(&config)).await?;
    if !resolved.fresh {
        println!(
            "Continuing workflow {} for topic '{}'",
            style(&resolved.workflow.id).bold(),
            resolved.workflow.topic
        );
    }
    execute(cli, &data_dir, resolved).await
}

pub async fn cmd_resume(cli: &Cli, workflow_id: &str) -> Result<()> {
    let data_dir = absolute_dir(&cli.data_dir());
    let _guard = telemetry::init(&cli.log_options(), Some(&data_dir.join(LOG_DIR)));

    let resolver = ResumeResolver::new(&data_dir)?;
    let id = WorkflowId::from(workflow_id);
    let resolved = resolver.resolve(ResumeTarget::Id(&id)).await?;
    execute(cli, &data_dir, resolved).await
}

async fn execute(cli: &Cli, data_dir: &Path, resolved: ResolvedWorkflow) -> Result<()> {
    let workflow_id = resolved.workflow.id.clone();
    let resume_hint = resume_command(data_dir, &workflow_id);
    let Some(start) = resolved.resume_at else {
        println!("Workflow {} has already completed every phase", style(&workflow_id).bold());
        return Ok(());
    };
    info!(workflow = %workflow_id, %start, fresh = resolved.fresh, "Starting run");

    let cancel = CancellationController::new();
    let listener = cancel.spawn_ctrl_c_listener();
    let drain_notice = spawn_drain_notice(&cancel);
    cancel.on_second_signal(|| {
        eprintln!("{} Second interrupt, aborting without a checkpoint", style("!").red().bold());
    });
    let judge = Arc::new(CommandJudge::from_config(&resolved.config.judge));
    let ctx = WorkflowContext::new(
        resolved.workflow,
        resolved.config,
        &resolved.location,
        resolved.store,
        judge,
        cancel,
    );

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let renderer = ui::spawn_renderer(RunProgress::new(start, cli.verbose), rx);
    let orchestrator = PhaseOrchestrator::new(ctx).with_event_channel(tx);
    let result = orchestrator.run(start).await;
    // Dropping the orchestrator closes the event channel so the renderer exits.
    drop(orchestrator);
    renderer.await.ok();
    listener.abort();
    drain_notice.abort();

    match result {
        Ok(summary) => {
            ui::print_summary(&summary, &resume_hint);
            Ok(())
        }
        Err(err) => {
            report_failure(&resume_hint, &err);
            Err(err.into())
        }
    }
}

/// Tell the operator what the first Ctrl-C does, once it arrives.
fn spawn_drain_notice(cancel: &CancellationController) -> tokio::task::JoinHandle<()> {
    let drain = cancel.drain_token();
    tokio::spawn(async move {
        drain.cancelled().await;
        eprintln!(
            "{} Interrupt received, finishing in-flight items. Press Ctrl-C again to abort.",
            style("!").yellow().bold()
        );
    })
}

fn report_failure(resume_hint: &str, err: &EngineError) {
    eprintln!();
    match err {
        EngineError::Aborted => eprintln!("{} Run aborted", style("!").red().bold()),
        _ => {
            if let Some(phase) = err.phase() {
                eprintln!("  Phase: {}", style(phase).yellow());
            }
            if let Some(item) = err.item_id() {
                eprintln!("  Item:  {}", item);
            }
        }
    }
    if !err.is_config() {
        eprintln!("  Resume with: {}", style(resume_hint).cyan());
    }
}
