//! Locating a workflow's durable state and deciding where to pick it up.

use std::path::{Path, PathBuf};

use sysrev_common::{Checkpoint, CheckpointStatus, Phase, Workflow, WorkflowId};
use tracing::{info, warn};

use crate::config::ReviewConfig;
use crate::errors::{ConfigError, EngineError, StoreError};
use crate::store::{CheckpointStore, Registry, RegistryEntry, SqliteStore};

pub const STATE_DB: &str = "state.db";
pub const CONFIG_SNAPSHOT: &str = "config.toml";
const WORKFLOWS_DIR: &str = "workflows";

/// How the caller identifies the workflow.
#[derive(Debug, Clone)]
pub enum ResumeTarget<'a> {
    Id(&'a WorkflowId),
    /// Matches only a workflow started with the same result-affecting config.
    Config(&'a ReviewConfig),
}

/// A workflow ready to hand to the orchestrator.
pub struct ResolvedWorkflow {
    pub workflow: Workflow,
    pub config: ReviewConfig,
    pub location: PathBuf,
    pub store: SqliteStore,
    /// `None` when every phase already completed.
    pub resume_at: Option<Phase>,
    /// True when no matching workflow existed and one was created.
    pub fresh: bool,
}

pub struct ResumeResolver {
    data_dir: PathBuf,
    registry: Registry,
}

impl ResumeResolver {
    pub fn new(data_dir: &Path) -> Result<Self, EngineError> {
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            registry: Registry::open(data_dir)?,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub async fn resolve(&self, target: ResumeTarget<'_>) -> Result<ResolvedWorkflow, EngineError> {
        match target {
            ResumeTarget::Id(id) => self.resolve_id(id).await,
            ResumeTarget::Config(config) => self.resolve_config(config).await,
        }
    }

    /// Find by ID through the registry, falling back to the conventional
    /// location under the data directory.
    async fn resolve_id(&self, id: &WorkflowId) -> Result<ResolvedWorkflow, EngineError> {
        let location = self
            .registry
            .find_by_id(id)?
            .map(|entry| entry.location)
            .unwrap_or_else(|| self.workflow_dir(id));
        if !location.join(STATE_DB).exists() {
            return Err(ConfigError::invalid(
                "workflow-id",
                format!("no workflow '{}' under {}", id, self.data_dir.display()),
            )
            .into());
        }

        let config = ReviewConfig::load_snapshot(&location.join(CONFIG_SNAPSHOT))?;
        self.open(id, config, location).await
    }

    async fn resolve_config(&self, config: &ReviewConfig) -> Result<ResolvedWorkflow, EngineError> {
        let hash = config.config_hash();
        if let Some(entry) = self.registry.find(&config.topic, &hash)? {
            info!(workflow = %entry.workflow_id, "Found workflow with matching topic and config");
            return self.open(&entry.workflow_id, config.clone(), entry.location).await;
        }

        if let Some(previous) = self.registry.find_by_topic(&config.topic)?.first() {
            warn!(
                previous = %previous.workflow_id,
                "Configuration changed since the last run on this topic, starting a fresh workflow"
            );
        }
        self.create(config, hash).await
    }

    async fn create(&self, config: &ReviewConfig, hash: String) -> Result<ResolvedWorkflow, EngineError> {
        let workflow = Workflow::new(&config.topic, &hash);
        let location = self.workflow_dir(&workflow.id);
        std::fs::create_dir_all(&location).map_err(|source| StoreError::Io {
            path: location.clone(),
            source,
        })?;

        let snapshot = config.to_snapshot()?;
        let snapshot_path = location.join(CONFIG_SNAPSHOT);
        std::fs::write(&snapshot_path, snapshot).map_err(|source| StoreError::Io {
            path: snapshot_path,
            source,
        })?;

        let store = SqliteStore::open(&location.join(STATE_DB))?;
        store.create_workflow(&workflow).await?;
        self.registry.register(&RegistryEntry {
            workflow_id: workflow.id.clone(),
            topic: workflow.topic.clone(),
            config_hash: hash,
            location: location.clone(),
            created_at: workflow.created_at,
        })?;
        info!(workflow = %workflow.id, location = %location.display(), "Created workflow");

        Ok(ResolvedWorkflow {
            workflow,
            config: config.clone(),
            location,
            store,
            resume_at: Some(Phase::first()),
            fresh: true,
        })
    }

    async fn open(
        &self,
        id: &WorkflowId,
        config: ReviewConfig,
        location: PathBuf,
    ) -> Result<ResolvedWorkflow, EngineError> {
        let store = SqliteStore::open_existing(&location.join(STATE_DB))?;
        store.verify_schema().await?;
        let workflow = store.load_workflow(id).await?.ok_or_else(|| {
            EngineError::Consistency(format!("state.db at {} has no row for workflow {}", location.display(), id))
        })?;

        let hash = config.config_hash();
        if workflow.config_hash != hash {
            return Err(EngineError::Consistency(format!(
                "workflow {} was started with config {} but the loaded config hashes to {}",
                id, workflow.config_hash, hash
            )));
        }

        let checkpoints = store.checkpoints(id).await?;
        let resume_at = resume_point(&checkpoints)?;
        Ok(ResolvedWorkflow {
            workflow,
            config,
            location,
            store,
            resume_at,
            fresh: false,
        })
    }

    fn workflow_dir(&self, id: &WorkflowId) -> PathBuf {
        self.data_dir.join(WORKFLOWS_DIR).join(id.as_str())
    }
}

/// The phase to run next, given checkpoints in phase order.
///
/// `completed` at P resumes at P+1; `partial` at P re-enters P. Every
/// checkpointed phase must have all of its predecessors completed, which
/// also means a `partial` can only be the last checkpoint.
pub fn resume_point(checkpoints: &[Checkpoint]) -> Result<Option<Phase>, EngineError> {
    let completed = |phase: Phase| {
        checkpoints
            .iter()
            .any(|c| c.phase == phase && c.status == CheckpointStatus::Completed)
    };
    for checkpoint in checkpoints {
        if let Some(missing) = checkpoint
            .phase
            .predecessors()
            .iter()
            .find(|p| !completed(**p))
        {
            return Err(EngineError::Consistency(format!(
                "checkpoint for phase {} exists but earlier phase {} is not completed",
                checkpoint.phase, missing
            )));
        }
    }

    Ok(match checkpoints.iter().max_by_key(|c| c.phase.index()) {
        None => Some(Phase::first()),
        Some(last) if last.status == CheckpointStatus::Partial => Some(last.phase),
        Some(last) => last.phase.next(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn cp(phase: Phase, status: CheckpointStatus) -> Checkpoint {
        Checkpoint {
            workflow_id: WorkflowId::from("wf"),
            phase,
            status,
            items_processed: 0,
            updated_at: Utc::now(),
        }
    }

    fn config(dir: &Path, criteria: &str) -> ReviewConfig {
        let content = format!(
            "topic = \"statins\"\n[input]\nitems = \"items.jsonl\"\n[screening]\ncriteria = \"{}\"\n",
            criteria
        );
        ReviewConfig::from_toml_str(&content, dir).unwrap()
    }

    #[test]
    fn test_resume_point_fresh_workflow() {
        assert_eq!(resume_point(&[]).unwrap(), Some(Phase::Search));
    }

    #[test]
    fn test_resume_point_after_completed() {
        let cps = [
            cp(Phase::Search, CheckpointStatus::Completed),
            cp(Phase::Screening, CheckpointStatus::Completed),
        ];
        assert_eq!(resume_point(&cps).unwrap(), Some(Phase::Extraction));
    }

    #[test]
    fn test_resume_point_reenters_partial() {
        let cps = [
            cp(Phase::Search, CheckpointStatus::Completed),
            cp(Phase::Screening, CheckpointStatus::Partial),
        ];
        assert_eq!(resume_point(&cps).unwrap(), Some(Phase::Screening));
    }

    #[test]
    fn test_resume_point_after_finalize() {
        let cps: Vec<_> = Phase::ALL
            .iter()
            .map(|p| cp(*p, CheckpointStatus::Completed))
            .collect();
        assert_eq!(resume_point(&cps).unwrap(), None);
    }

    #[test]
    fn test_gap_is_a_consistency_error() {
        let cps = [
            cp(Phase::Search, CheckpointStatus::Completed),
            cp(Phase::Extraction, CheckpointStatus::Completed),
        ];
        assert!(matches!(resume_point(&cps), Err(EngineError::Consistency(_))));

        let cps = [
            cp(Phase::Search, CheckpointStatus::Completed),
            cp(Phase::Screening, CheckpointStatus::Partial),
            cp(Phase::Extraction, CheckpointStatus::Completed),
        ];
        assert!(matches!(resume_point(&cps), Err(EngineError::Consistency(_))));
    }

    #[tokio::test]
    async fn test_same_config_resumes_same_workflow() {
        let dir = tempdir().unwrap();
        let resolver = ResumeResolver::new(&dir.path().join("data")).unwrap();
        let config = config(dir.path(), "adults");

        let first = resolver.resolve(ResumeTarget::Config(&config)).await.unwrap();
        assert!(first.fresh);
        assert_eq!(first.resume_at, Some(Phase::Search));

        let second = resolver.resolve(ResumeTarget::Config(&config)).await.unwrap();
        assert!(!second.fresh);
        assert_eq!(second.workflow.id, first.workflow.id);
    }

    #[tokio::test]
    async fn test_changed_config_starts_fresh_workflow() {
        let dir = tempdir().unwrap();
        let resolver = ResumeResolver::new(&dir.path().join("data")).unwrap();
        let first = resolver
            .resolve(ResumeTarget::Config(&config(dir.path(), "adults")))
            .await
            .unwrap();
        let second = resolver
            .resolve(ResumeTarget::Config(&config(dir.path(), "adults over 65")))
            .await
            .unwrap();
        assert!(second.fresh);
        assert_ne!(second.workflow.id, first.workflow.id);
    }

    #[tokio::test]
    async fn test_resolve_by_id_uses_snapshot() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let created = {
            let resolver = ResumeResolver::new(&data).unwrap();
            resolver
                .resolve(ResumeTarget::Config(&config(dir.path(), "adults")))
                .await
                .unwrap()
        };
        created
            .store
            .write_checkpoint(&created.workflow.id, Phase::Search, CheckpointStatus::Completed, 3)
            .await
            .unwrap();

        let resolver = ResumeResolver::new(&data).unwrap();
        let resolved = resolver.resolve(ResumeTarget::Id(&created.workflow.id)).await.unwrap();
        assert_eq!(resolved.resume_at, Some(Phase::Screening));
        assert_eq!(resolved.config.screening.criteria, "adults");
        assert_eq!(resolved.config.config_hash(), created.workflow.config_hash);
    }

    #[tokio::test]
    async fn test_unknown_id_is_reported() {
        let dir = tempdir().unwrap();
        let resolver = ResumeResolver::new(dir.path()).unwrap();
        let err = resolver
            .resolve(ResumeTarget::Id(&WorkflowId::from("wf-missing")))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("wf-missing"));
    }

    #[tokio::test]
    async fn test_unknown_phase_in_checkpoints_is_consistency_error() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let resolver = ResumeResolver::new(&data).unwrap();
        let created = resolver
            .resolve(ResumeTarget::Config(&config(dir.path(), "adults")))
            .await
            .unwrap();
        {
            let guard = created.store.handle().lock_sync().unwrap();
            guard
                .conn()
                .execute(
                    "INSERT INTO checkpoints VALUES (?1, 'peer_review', 'completed', 0, ?2)",
                    rusqlite::params![created.workflow.id.as_str(), Utc::now().to_rfc3339()],
                )
                .unwrap();
        }
        let err = resolver
            .resolve(ResumeTarget::Id(&created.workflow.id))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Consistency(ref m) if m.contains("peer_review")));
    }
}
