use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;
use sysrev_common::{Actor, Checkpoint, CheckpointStatus, Decision, Phase, Workflow};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::orchestrator::{PhaseEvent, PhaseReport, RunSummary};
use crate::store::PhaseCost;
use crate::ui::icons::{CHECK, CROSS, PAUSE, PROGRESS, SCALES};

/// Terminal progress for a run, rendered via `indicatif`.
///
/// Two bars are stacked: one counting phases, one counting items in the
/// current item phase. Non-item phases show a spinner on the item bar.
/// When stderr is not a terminal `indicatif` draws nothing and only the
/// printed lines remain.
pub struct RunProgress {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    item_bar: ProgressBar,
    verbose: bool,
}

impl RunProgress {
    pub fn new(start: Phase, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let phase_bar = multi.add(ProgressBar::new(Phase::ALL.len() as u64));
        phase_bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░"),
        );
        phase_bar.set_prefix("Phases");
        phase_bar.set_position(start.index() as u64);

        let item_bar = multi.add(ProgressBar::new(0));
        item_bar.set_style(item_style());
        item_bar.set_prefix(" Items");

        Self {
            multi,
            phase_bar,
            item_bar,
            verbose,
        }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn handle(&self, event: &PhaseEvent) {
        match event {
            PhaseEvent::PhaseStarted {
                phase,
                total,
                already_processed,
            } => {
                self.phase_bar
                    .set_message(format!("{}", style(phase).yellow()));
                if phase.is_item_phase() {
                    self.item_bar.set_style(item_style());
                    self.item_bar.set_length(*total);
                    self.item_bar.set_position(*already_processed);
                    self.item_bar.set_message(if *already_processed > 0 {
                        format!("{} already decided", already_processed)
                    } else {
                        String::new()
                    });
                } else {
                    self.item_bar.set_style(
                        ProgressStyle::default_spinner()
                            .template("{prefix:.bold.dim} {spinner} {msg}")
                            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                    );
                    self.item_bar.set_message(format!("running {}", phase));
                    self.item_bar.enable_steady_tick(Duration::from_millis(100));
                }
            }
            PhaseEvent::ItemCompleted {
                item_id,
                decision,
                adjudicated,
                ..
            } => {
                self.item_bar.inc(1);
                if self.verbose || *adjudicated {
                    let marker = if *adjudicated { SCALES.to_string() } else { String::new() };
                    self.print_line(format!(
                        "    {}{} {}",
                        marker,
                        style(item_id).dim(),
                        styled_decision(*decision)
                    ));
                }
            }
            PhaseEvent::ItemFailed { item_id, error, .. } => {
                self.print_line(format!(
                    "    {}{} {}",
                    CROSS,
                    style(item_id).dim(),
                    style(error).red()
                ));
            }
            PhaseEvent::Draining { phase } => {
                self.print_line(format!(
                    "{}{} stopped early after an interrupt, progress saved",
                    PAUSE,
                    style(phase).yellow()
                ));
            }
            PhaseEvent::PhaseCompleted { report } => {
                self.item_bar.disable_steady_tick();
                if report.status == CheckpointStatus::Completed {
                    self.phase_bar.inc(1);
                }
                self.print_line(phase_line(report));
            }
            PhaseEvent::RunFinished { .. } => self.finish(),
        }
    }

    pub fn finish(&self) {
        self.item_bar.finish_and_clear();
        self.phase_bar.finish_and_clear();
    }
}

fn item_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:.bold.dim} [{bar:30.green/white}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░")
}

fn styled_decision(decision: Decision) -> String {
    match decision {
        Decision::Include => style("include").green().to_string(),
        Decision::Exclude => style("exclude").red().to_string(),
        Decision::Uncertain => style("uncertain").yellow().to_string(),
    }
}

fn phase_line(report: &PhaseReport) -> String {
    let icon = if report.status == CheckpointStatus::Completed { CHECK } else { PAUSE };
    let mut line = format!(
        "{}{} {} ({} items, {} new",
        icon,
        style(report.phase).bold(),
        report.status,
        report.items_processed,
        report.newly_processed
    );
    if report.adjudicated > 0 {
        line.push_str(&format!(", {} adjudicated", report.adjudicated));
    }
    line.push_str(&format!(", {:.1}s)", report.duration.as_secs_f64()));
    line
}

/// Forward events from the orchestrator to a renderer until the sender
/// side closes.
pub fn spawn_renderer(progress: RunProgress, mut rx: mpsc::Receiver<PhaseEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let finished = matches!(event, PhaseEvent::RunFinished { .. });
            progress.handle(&event);
            if finished {
                break;
            }
        }
        progress.finish();
    })
}

/// `resume_hint` is the exact command that continues the workflow.
pub fn print_summary(summary: &RunSummary, resume_hint: &str) {
    println!();
    match summary.resume_at {
        None => println!(
            "{}Workflow {} completed",
            CHECK,
            style(&summary.workflow_id).bold()
        ),
        Some(phase) => {
            println!(
                "{}Workflow {} stopped in phase {}",
                PAUSE,
                style(&summary.workflow_id).bold(),
                style(phase).yellow()
            );
            println!(
                "  Resume with: {}",
                style(resume_hint).cyan()
            );
        }
    }
}

/// Everything `sysrev status` shows about one workflow.
pub struct StatusReport {
    pub workflow: Workflow,
    pub checkpoints: Vec<Checkpoint>,
    pub outcomes: Vec<(Phase, Vec<(Actor, u64)>)>,
    pub costs: Vec<PhaseCost>,
    pub next: Option<Phase>,
}

pub fn print_status(report: &StatusReport) {
    let StatusReport {
        workflow,
        checkpoints,
        outcomes,
        costs,
        next,
    } = report;
    println!("{}{} {}", PROGRESS, style("Workflow").bold(), workflow.id);
    println!("  Topic:   {}", workflow.topic);
    println!("  Status:  {}", workflow.status);
    println!("  Created: {}", workflow.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    println!("  {:<12} {:<10} {:>8}", "PHASE", "STATUS", "ITEMS");
    for phase in Phase::ALL {
        let (state, items) = match checkpoints.iter().find(|c| c.phase == phase) {
            Some(cp) if cp.status == CheckpointStatus::Completed => (
                style(cp.status.to_string()).green().to_string(),
                cp.items_processed.to_string(),
            ),
            Some(cp) => (
                style(cp.status.to_string()).yellow().to_string(),
                cp.items_processed.to_string(),
            ),
            None => (style("-".to_string()).dim().to_string(), "-".to_string()),
        };
        println!("  {:<12} {:<10} {:>8}", phase.as_str(), state, items);
    }

    for (phase, counts) in outcomes {
        if counts.iter().all(|(_, n)| *n == 0) {
            continue;
        }
        let counts: Vec<String> = counts.iter().map(|(actor, n)| format!("{}={}", actor, n)).collect();
        println!("  {:<12} {}", phase.as_str(), style(counts.join(" ")).dim());
    }

    if !costs.is_empty() {
        println!();
        println!("  {:<12} {:>6} {:>10} {:>10} {:>10}", "PHASE", "CALLS", "IN", "OUT", "USD");
        let mut total = 0.0;
        for cost in costs {
            total += cost.cost_usd;
            println!(
                "  {:<12} {:>6} {:>10} {:>10} {:>10.4}",
                cost.phase.as_str(), cost.calls, cost.input_tokens, cost.output_tokens, cost.cost_usd
            );
        }
        println!("  {:<12} {:>6} {:>10} {:>10} {:>10.4}", "total", "", "", "", total);
    }

    println!();
    match next {
        Some(phase) => println!("  Next phase: {}", style(phase).yellow()),
        None => println!("  {}All phases completed", CHECK),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::RunState;

    fn report(status: CheckpointStatus, adjudicated: u64) -> PhaseReport {
        PhaseReport {
            phase: Phase::Screening,
            status,
            items_processed: 10,
            newly_processed: 4,
            adjudicated,
            duration: Duration::from_millis(1500),
        }
    }

    #[test]
    fn phase_line_mentions_adjudication_only_when_present() {
        let line = phase_line(&report(CheckpointStatus::Completed, 0));
        assert!(line.contains("10 items, 4 new"));
        assert!(!line.contains("adjudicated"));

        let line = phase_line(&report(CheckpointStatus::Partial, 2));
        assert!(line.contains("partial"));
        assert!(line.contains("2 adjudicated"));
    }

    #[tokio::test]
    async fn renderer_stops_on_run_finished() {
        let (tx, rx) = mpsc::channel(8);
        let handle = spawn_renderer(RunProgress::new(Phase::Search, false), rx);
        tx.send(PhaseEvent::PhaseStarted {
            phase: Phase::Screening,
            total: 3,
            already_processed: 1,
        })
        .await
        .unwrap();
        tx.send(PhaseEvent::RunFinished {
            state: RunState::Done,
        })
        .await
        .unwrap();
        handle.await.unwrap();
        // The receiver is gone once the renderer returns.
        assert!(tx.is_closed());
    }
}
