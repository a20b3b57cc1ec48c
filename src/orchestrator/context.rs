use std::path::{Path, PathBuf};
use std::sync::Arc;

use sysrev_common::{Phase, Workflow, WorkflowId};

use crate::cancel::CancellationController;
use crate::config::ReviewConfig;
use crate::consensus::{ConsensusEngine, ConsensusSettings};
use crate::errors::EngineError;
use crate::judge::JudgmentClient;
use crate::ratelimit::RateLimiter;
use crate::store::SqliteStore;

/// Everything one `run`/`resume` invocation shares across its phases.
///
/// Built once per invocation and handed to the orchestrator; nothing here
/// outlives the command that created it.
#[derive(Clone)]
pub struct WorkflowContext {
    pub workflow: Workflow,
    pub config: Arc<ReviewConfig>,
    /// `<data_dir>/workflows/<id>`: state.db, config snapshot, artifacts.
    pub dir: PathBuf,
    pub store: Arc<SqliteStore>,
    pub limiter: RateLimiter,
    pub judge: Arc<dyn JudgmentClient>,
    pub cancel: CancellationController,
}

impl WorkflowContext {
    pub fn new(
        workflow: Workflow,
        config: ReviewConfig,
        dir: &Path,
        store: SqliteStore,
        judge: Arc<dyn JudgmentClient>,
        cancel: CancellationController,
    ) -> Self {
        let limiter = RateLimiter::new(&config.tiers);
        Self {
            workflow,
            config: Arc::new(config),
            dir: dir.to_path_buf(),
            store: Arc::new(store),
            limiter,
            judge,
            cancel,
        }
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow.id
    }

    /// Consensus engine for an item phase.
    pub fn consensus_engine(&self, stage: Phase) -> Result<ConsensusEngine, EngineError> {
        let stage_config = self
            .config
            .stage(stage)
            .ok_or_else(|| EngineError::Consistency(format!("phase {} has no item configuration", stage)))?;
        Ok(ConsensusEngine::new(
            self.workflow.id.clone(),
            &self.workflow.topic,
            stage,
            ConsensusSettings::from_config(stage_config, &self.config.judge),
            self.judge.clone(),
            self.limiter.clone(),
            self.store.clone(),
            self.store.clone(),
        ))
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}
