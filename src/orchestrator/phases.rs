//! Handlers for the phases that are not split into reviewed items, plus the
//! hand-off of accepted items to the next item phase.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sysrev_common::{Actor, Decision, Document, Item, ItemOutcome, Phase, WorkflowId, WorkflowStatus};
use tracing::{info, warn};

use super::context::WorkflowContext;
use crate::errors::{ConfigError, EngineError, StoreError};
use crate::store::{CostLedger, ItemStore};

pub const SYNTHESIS_FILE: &str = "synthesis_input.json";
pub const REPORT_FILE: &str = "report.md";

/// One line of the JSONL input handed over by the search connectors.
#[derive(Debug, Clone, Deserialize)]
pub struct InputRecord {
    pub id: String,
    #[serde(flatten)]
    pub document: Document,
}

/// Parse the candidate list. Blank lines are skipped; repeated IDs keep the
/// first occurrence.
pub fn read_input(path: &Path) -> Result<Vec<Item>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Input {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: InputRecord = serde_json::from_str(line).map_err(|e| ConfigError::Input {
            path: path.to_path_buf(),
            message: format!("line {}: {}", lineno + 1, e),
        })?;
        if record.id.trim().is_empty() {
            return Err(ConfigError::Input {
                path: path.to_path_buf(),
                message: format!("line {}: empty id", lineno + 1),
            });
        }
        if !seen.insert(record.id.clone()) {
            warn!(id = %record.id, line = lineno + 1, "Duplicate item id in input, keeping first");
            continue;
        }
        items.push(Item::new(&record.id, Phase::Screening, record.document));
    }
    Ok(items)
}

/// Search: queue the candidate documents for screening.
pub(super) async fn ingest(ctx: &WorkflowContext) -> Result<u64, EngineError> {
    let path = ctx.config.items_path();
    let items = read_input(&path)?;
    let added = ctx.store.enqueue_items(ctx.workflow_id(), &items).await?;
    let queued = ctx.store.items(ctx.workflow_id(), Phase::Screening).await?.len() as u64;
    info!(path = %path.display(), read = items.len(), added, queued, "Ingested candidates");
    Ok(queued)
}

/// Items of `phase` whose final decision is include, restaged for `next`.
pub(super) async fn accepted_items(
    ctx: &WorkflowContext,
    phase: Phase,
    next: Phase,
) -> Result<Vec<Item>, EngineError> {
    let included: HashSet<String> = ctx
        .store
        .final_outcomes(ctx.workflow_id(), phase)
        .await?
        .into_iter()
        .filter(|o| o.decision == Decision::Include)
        .map(|o| o.item_id)
        .collect();
    Ok(ctx
        .store
        .items(ctx.workflow_id(), phase)
        .await?
        .into_iter()
        .filter(|item| included.contains(&item.id))
        .map(|item| Item::new(&item.id, next, item.payload))
        .collect())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SynthesisInput {
    pub workflow_id: WorkflowId,
    pub topic: String,
    pub generated_at: chrono::DateTime<Utc>,
    pub studies: Vec<StudyRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StudyRecord {
    pub id: String,
    #[serde(flatten)]
    pub document: Document,
    pub extraction_confidence: f64,
    pub extraction_notes: String,
}

/// Synthesis: hand the extracted studies to the statistics tooling.
pub(super) async fn synthesize(ctx: &WorkflowContext) -> Result<u64, EngineError> {
    let wf = ctx.workflow_id();
    let finals: HashMap<String, ItemOutcome> = ctx
        .store
        .final_outcomes(wf, Phase::Extraction)
        .await?
        .into_iter()
        .filter(|o| o.decision == Decision::Include)
        .map(|o| (o.item_id.clone(), o))
        .collect();

    let studies: Vec<StudyRecord> = ctx
        .store
        .items(wf, Phase::Extraction)
        .await?
        .into_iter()
        .filter_map(|item| {
            finals.get(&item.id).map(|outcome| StudyRecord {
                id: item.id.clone(),
                document: item.payload,
                extraction_confidence: outcome.confidence,
                extraction_notes: outcome.rationale.clone(),
            })
        })
        .collect();

    let input = SynthesisInput {
        workflow_id: wf.clone(),
        topic: ctx.workflow.topic.clone(),
        generated_at: Utc::now(),
        studies,
    };
    let json = serde_json::to_string_pretty(&input).map_err(StoreError::from)?;
    write_atomic(&ctx.artifact_path(SYNTHESIS_FILE), &json).await?;
    info!(studies = input.studies.len(), "Wrote synthesis input");
    Ok(input.studies.len() as u64)
}

#[derive(Debug, Default, PartialEq)]
struct DecisionCounts {
    include: u64,
    exclude: u64,
    uncertain: u64,
}

impl DecisionCounts {
    fn tally(outcomes: &[ItemOutcome]) -> Self {
        let mut counts = Self::default();
        for outcome in outcomes {
            match outcome.decision {
                Decision::Include => counts.include += 1,
                Decision::Exclude => counts.exclude += 1,
                Decision::Uncertain => counts.uncertain += 1,
            }
        }
        counts
    }
}

/// Writing: render the flow-of-records report.
pub(super) async fn write_report(ctx: &WorkflowContext) -> Result<u64, EngineError> {
    let wf = ctx.workflow_id();
    let store = &ctx.store;

    let identified = store.items(wf, Phase::Screening).await?.len();
    let screening = DecisionCounts::tally(&store.final_outcomes(wf, Phase::Screening).await?);
    let screening_adjudicated = store.count_outcomes(wf, Phase::Screening, Actor::Adjudicator).await?;
    let assessed = store.items(wf, Phase::Extraction).await?.len();
    let extraction = DecisionCounts::tally(&store.final_outcomes(wf, Phase::Extraction).await?);
    let costs = store.cost_by_phase(wf).await?;
    let total_cost = store.total_cost(wf).await?;

    let mut report = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(report, "# {}\n", ctx.workflow.topic);
    let _ = writeln!(report, "Workflow `{}`, generated {}\n", wf, Utc::now().to_rfc3339());
    let _ = writeln!(report, "## Flow of records\n");
    let _ = writeln!(report, "| Stage | Count |\n|---|---|");
    let _ = writeln!(report, "| Records identified | {} |", identified);
    let _ = writeln!(report, "| Excluded at screening | {} |", screening.exclude);
    let _ = writeln!(report, "| Uncertain at screening | {} |", screening.uncertain);
    let _ = writeln!(report, "| Adjudicated at screening | {} |", screening_adjudicated);
    let _ = writeln!(report, "| Assessed for eligibility | {} |", assessed);
    let _ = writeln!(report, "| Excluded at extraction | {} |", extraction.exclude + extraction.uncertain);
    let _ = writeln!(report, "| Studies included | {} |\n", extraction.include);
    let _ = writeln!(report, "## Cost\n");
    let _ = writeln!(report, "| Phase | Calls | Input tokens | Output tokens | USD |\n|---|---|---|---|---|");
    for cost in &costs {
        let _ = writeln!(
            report,
            "| {} | {} | {} | {} | {:.4} |",
            cost.phase, cost.calls, cost.input_tokens, cost.output_tokens, cost.cost_usd
        );
    }
    let _ = writeln!(report, "\nTotal: ${:.4}", total_cost);

    write_atomic(&ctx.artifact_path(REPORT_FILE), &report).await?;
    info!(included = extraction.include, "Wrote report");
    Ok(extraction.include)
}

/// Finalize: mark the workflow completed.
pub(super) async fn finalize(ctx: &WorkflowContext) -> Result<u64, EngineError> {
    ctx.store
        .set_workflow_status(ctx.workflow_id(), WorkflowStatus::Completed)
        .await?;
    Ok(0)
}

/// Write via a temp file and rename, so readers never see a torn artifact.
async fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    tokio::fs::write(&tmp, content).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_input_skips_blank_and_duplicate_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"id\": \"p1\", \"title\": \"Statins\", \"abstract\": \"RCT\", \"year\": 2020}\n",
                "\n",
                "{\"id\": \"p2\", \"title\": \"Aspirin\"}\n",
                "{\"id\": \"p1\", \"title\": \"Statins again\"}\n",
            ),
        )
        .unwrap();

        let items = read_input(&path).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "p1");
        assert_eq!(items[0].payload.title, "Statins");
        assert_eq!(items[0].payload.year, Some(2020));
        assert_eq!(items[0].stage, Phase::Screening);
    }

    #[test]
    fn test_read_input_reports_bad_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.jsonl");
        std::fs::write(&path, "{\"id\": \"p1\", \"title\": \"ok\"}\nnot json\n").unwrap();
        let err = read_input(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_read_input_missing_file() {
        let err = read_input(Path::new("/nonexistent/items.jsonl")).unwrap_err();
        assert!(matches!(err, ConfigError::Input { .. }));
    }

    #[test]
    fn test_tally() {
        let wf = WorkflowId::from("wf");
        let outcomes: Vec<ItemOutcome> = [Decision::Include, Decision::Exclude, Decision::Include]
            .iter()
            .enumerate()
            .map(|(i, d)| ItemOutcome::new(&wf, Phase::Screening, &format!("p{}", i), Actor::Final, *d, 0.9, ""))
            .collect();
        assert_eq!(
            DecisionCounts::tally(&outcomes),
            DecisionCounts {
                include: 2,
                exclude: 1,
                uncertain: 0
            }
        );
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.md");
        write_atomic(&path, "first").await.unwrap();
        write_atomic(&path, "second").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!dir.path().join("report.md.tmp").exists());
    }
}
