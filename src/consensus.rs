//! Dual-reviewer consensus with adjudication.
//!
//! For each item two judges are consulted concurrently. Matching, confident
//! decisions are accepted as final; anything else goes to a third,
//! adjudicator call whose decision is binding. Every call result is
//! persisted the moment it returns, and results already on disk from an
//! interrupted run are reused rather than re-requested.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sysrev_common::{Actor, CostUnit, Decision, Item, ItemOutcome, Phase, Tier, Usage, WorkflowId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{JudgeConfig, StageConfig};
use crate::errors::{EngineError, JudgeError};
use crate::judge::{JudgeRequest, JudgeRole, JudgmentClient, PriorOpinion};
use crate::ratelimit::RateLimiter;
use crate::store::{CostLedger, ItemStore, RecordStatus};

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Stage-level consensus configuration, resolved from the run config.
#[derive(Debug, Clone)]
pub struct ConsensusSettings {
    pub dual_review: bool,
    pub require_confidence: bool,
    pub include_threshold: f64,
    pub exclude_threshold: f64,
    pub judge_tier: Tier,
    pub adjudicator_tier: Tier,
    pub judge_retry: RetryPolicy,
    pub adjudicator_retry: RetryPolicy,
    pub criteria: String,
    pub temperature_a: f64,
    pub temperature_b: f64,
    pub temperature_adjudicator: f64,
}

impl ConsensusSettings {
    pub fn from_config(stage: &StageConfig, judge: &JudgeConfig) -> Self {
        Self {
            dual_review: stage.dual_review,
            require_confidence: stage.require_confidence,
            include_threshold: stage.include_threshold,
            exclude_threshold: stage.exclude_threshold,
            judge_tier: stage.judge_tier(),
            adjudicator_tier: stage.adjudicator_tier(),
            judge_retry: RetryPolicy::new(stage.judge_attempts, stage.backoff()),
            adjudicator_retry: RetryPolicy::new(stage.adjudicator_attempts, stage.backoff()),
            criteria: stage.criteria.clone(),
            temperature_a: judge.temperature_a,
            temperature_b: judge.temperature_b,
            temperature_adjudicator: judge.temperature_adjudicator,
        }
    }

    /// Whether a single reviewer's verdict is strong enough to stand alone.
    fn is_confident(&self, outcome: &ItemOutcome) -> bool {
        match outcome.decision {
            Decision::Uncertain => false,
            _ if !self.require_confidence => true,
            Decision::Include => outcome.confidence >= self.include_threshold,
            Decision::Exclude => outcome.confidence >= self.exclude_threshold,
        }
    }
}

/// Derived view of how an item was decided. Not stored; rebuilt from outcome rows.
#[derive(Debug, Clone)]
pub struct ConsensusResult {
    pub item_id: String,
    pub reviewer_a: Option<ItemOutcome>,
    pub reviewer_b: Option<ItemOutcome>,
    /// Both reviewers answered and their decisions are equal.
    pub agreement: bool,
    pub adjudication: Option<ItemOutcome>,
    pub final_outcome: ItemOutcome,
}

impl ConsensusResult {
    pub fn was_adjudicated(&self) -> bool {
        self.adjudication.is_some()
    }
}

/// Everything the engine needs for one stage of one workflow.
pub struct ConsensusEngine {
    workflow_id: WorkflowId,
    topic: String,
    stage: Phase,
    settings: ConsensusSettings,
    client: Arc<dyn JudgmentClient>,
    limiter: RateLimiter,
    outcomes: Arc<dyn ItemStore>,
    costs: Arc<dyn CostLedger>,
    cancel: CancellationToken,
}

impl ConsensusEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflow_id: WorkflowId,
        topic: &str,
        stage: Phase,
        settings: ConsensusSettings,
        client: Arc<dyn JudgmentClient>,
        limiter: RateLimiter,
        outcomes: Arc<dyn ItemStore>,
        costs: Arc<dyn CostLedger>,
    ) -> Self {
        Self {
            workflow_id,
            topic: topic.to_string(),
            stage,
            settings,
            client,
            limiter,
            outcomes,
            costs,
            cancel: CancellationToken::new(),
        }
    }

    /// Interrupt rate-limit waits and retry backoff when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn stage(&self) -> Phase {
        self.stage
    }

    /// Decide one item, persisting each reviewer call and the final row.
    pub async fn evaluate(&self, item: &Item) -> Result<ConsensusResult, EngineError> {
        let existing = self
            .outcomes
            .outcomes_for_item(&self.workflow_id, self.stage, &item.id)
            .await?;
        let find = |actor: Actor| existing.iter().find(|o| o.actor == actor).cloned();

        let prior_a = find(Actor::JudgeA);
        let prior_b = find(Actor::JudgeB);
        let prior_adjudication = find(Actor::Adjudicator);

        if let Some(final_outcome) = find(Actor::Final) {
            debug!(item = %item.id, "Item already decided, reusing final outcome");
            let agreement = matches!((&prior_a, &prior_b), (Some(a), Some(b)) if a.decision == b.decision);
            return Ok(ConsensusResult {
                item_id: item.id.clone(),
                reviewer_a: prior_a,
                reviewer_b: prior_b,
                agreement,
                adjudication: prior_adjudication,
                final_outcome,
            });
        }

        let (result_a, result_b) = if self.settings.dual_review {
            tokio::join!(
                self.reviewer(item, JudgeRole::JudgeA, prior_a),
                self.reviewer(item, JudgeRole::JudgeB, prior_b),
            )
        } else {
            (self.reviewer(item, JudgeRole::JudgeA, prior_a).await, Ok(None))
        };

        // Non-transient failures win over anything the other reviewer did.
        let (reviewer_a, failed_a) = split_transient(result_a)?;
        let (reviewer_b, failed_b) = split_transient(result_b)?;

        let mut prior = Vec::new();
        let mut missing_opinion = false;
        for (actor, reviewer, failed) in [
            (Actor::JudgeA, &reviewer_a, &failed_a),
            (Actor::JudgeB, &reviewer_b, &failed_b),
        ] {
            match (reviewer, failed) {
                (Some(outcome), _) => prior.push(opinion(outcome)),
                (None, Some(err)) => {
                    prior.push(PriorOpinion::unavailable(actor, &err.to_string()));
                    missing_opinion = true;
                }
                (None, None) => {}
            }
        }

        // With no opinion at all there is nothing to adjudicate.
        if reviewer_a.is_none() && reviewer_b.is_none() {
            let err = failed_a.or(failed_b).unwrap_or_else(|| EngineError::TransientCall {
                item_id: item.id.clone(),
                actor: Actor::JudgeA,
                source: JudgeError::InvalidResponse("no reviewer produced an opinion".into()),
            });
            return Err(err);
        }

        let agreement = matches!(
            (&reviewer_a, &reviewer_b),
            (Some(a), Some(b)) if a.decision == b.decision
        );

        let auto_final = match (&reviewer_a, &reviewer_b) {
            (Some(a), Some(b)) if agreement && self.settings.is_confident(a) && self.settings.is_confident(b) => {
                Some(self.outcome(
                    &item.id,
                    Actor::Final,
                    a.decision,
                    a.confidence.min(b.confidence),
                    &format!("Reviewers agreed. A: {} | B: {}", a.rationale, b.rationale),
                ))
            }
            (Some(a), None) if !self.settings.dual_review && self.settings.is_confident(a) => {
                Some(self.outcome(&item.id, Actor::Final, a.decision, a.confidence, &a.rationale))
            }
            _ => None,
        };

        let (adjudication, final_outcome) = match auto_final {
            Some(final_outcome) => (None, final_outcome),
            None => {
                let adjudication = match prior_adjudication {
                    Some(existing) => existing,
                    None => {
                        let outcome = self
                            .call_with_retry(item, JudgeRole::Adjudicator, prior)
                            .await?;
                        info!(item = %item.id, decision = %outcome.decision, "Adjudicated");
                        outcome
                    }
                };
                let mut rationale = adjudication.rationale.clone();
                if missing_opinion {
                    rationale.push_str(" [no second opinion available]");
                }
                let final_outcome = self.outcome(
                    &item.id,
                    Actor::Final,
                    adjudication.decision,
                    adjudication.confidence,
                    &rationale,
                );
                (Some(adjudication), final_outcome)
            }
        };

        if self.outcomes.record_outcome(&final_outcome).await? == RecordStatus::Duplicate {
            warn!(item = %item.id, "Final outcome already recorded, keeping the stored row");
        }

        Ok(ConsensusResult {
            item_id: item.id.clone(),
            reviewer_a,
            reviewer_b,
            agreement,
            adjudication,
            final_outcome,
        })
    }

    async fn reviewer(
        &self,
        item: &Item,
        role: JudgeRole,
        existing: Option<ItemOutcome>,
    ) -> Result<Option<ItemOutcome>, EngineError> {
        if let Some(outcome) = existing {
            debug!(item = %item.id, %role, "Reusing persisted reviewer outcome");
            return Ok(Some(outcome));
        }
        self.call_with_retry(item, role, Vec::new()).await.map(Some)
    }

    async fn call_with_retry(
        &self,
        item: &Item,
        role: JudgeRole,
        prior: Vec<PriorOpinion>,
    ) -> Result<ItemOutcome, EngineError> {
        let (tier, policy, temperature) = match role {
            JudgeRole::JudgeA => (&self.settings.judge_tier, self.settings.judge_retry, self.settings.temperature_a),
            JudgeRole::JudgeB => (&self.settings.judge_tier, self.settings.judge_retry, self.settings.temperature_b),
            JudgeRole::Adjudicator => (
                &self.settings.adjudicator_tier,
                self.settings.adjudicator_retry,
                self.settings.temperature_adjudicator,
            ),
        };
        let request = JudgeRequest {
            topic: self.topic.clone(),
            stage: self.stage,
            item: item.clone(),
            role,
            criteria: self.settings.criteria.clone(),
            temperature,
            prior,
        };

        let mut attempt = 1;
        loop {
            let ticket = self.limiter.reserve(tier, &self.cancel).await?;
            let started = Instant::now();
            let result = self.client.judge(&request).await;
            drop(ticket);
            let latency_ms = started.elapsed().as_millis() as u64;

            let usage = result.as_ref().map(|j| j.usage).unwrap_or_default();
            self.record_cost(&item.id, role.actor(), tier, usage, latency_ms).await?;

            match result {
                Ok(judgment) => {
                    let outcome = self.outcome(
                        &item.id,
                        role.actor(),
                        judgment.decision,
                        judgment.confidence,
                        &judgment.rationale,
                    );
                    if self.outcomes.record_outcome(&outcome).await? == RecordStatus::Duplicate {
                        warn!(item = %item.id, %role, "Outcome already recorded, keeping the stored row");
                    }
                    return Ok(outcome);
                }
                Err(source) if source.is_retryable() && attempt < policy.attempts => {
                    let delay = policy.delay(attempt);
                    warn!(item = %item.id, %role, attempt, ?delay, error = %source, "Judgment call failed, retrying");
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(EngineError::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(source) if source.is_retryable() => {
                    warn!(item = %item.id, %role, attempts = attempt, error = %source, "Judgment call failed, giving up");
                    return Err(EngineError::TransientCall {
                        item_id: item.id.clone(),
                        actor: role.actor(),
                        source,
                    });
                }
                Err(source) => {
                    return Err(EngineError::FatalCall {
                        item_id: item.id.clone(),
                        actor: role.actor(),
                        source,
                    });
                }
            }
        }
    }

    async fn record_cost(
        &self,
        item_id: &str,
        actor: Actor,
        tier: &Tier,
        usage: Usage,
        latency_ms: u64,
    ) -> Result<(), EngineError> {
        let unit = CostUnit {
            workflow_id: self.workflow_id.clone(),
            phase: self.stage,
            tier: tier.clone(),
            actor,
            item_id: Some(item_id.to_string()),
            usage,
            latency_ms,
            recorded_at: Utc::now(),
        };
        self.costs.record_cost(&unit).await?;
        Ok(())
    }

    fn outcome(
        &self,
        item_id: &str,
        actor: Actor,
        decision: Decision,
        confidence: f64,
        rationale: &str,
    ) -> ItemOutcome {
        ItemOutcome::new(
            &self.workflow_id,
            self.stage,
            item_id,
            actor,
            decision,
            confidence,
            rationale,
        )
    }
}

fn opinion(outcome: &ItemOutcome) -> PriorOpinion {
    PriorOpinion {
        actor: outcome.actor,
        decision: Some(outcome.decision),
        confidence: outcome.confidence,
        rationale: outcome.rationale.clone(),
    }
}

/// Separate an exhausted transient failure (which escalates) from errors
/// that must abort the item.
fn split_transient(
    result: Result<Option<ItemOutcome>, EngineError>,
) -> Result<(Option<ItemOutcome>, Option<EngineError>), EngineError> {
    match result {
        Ok(outcome) => Ok((outcome, None)),
        Err(err @ EngineError::TransientCall { .. }) => Ok((None, Some(err))),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::Judgment;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use sysrev_common::Document;

    /// Scripted reply per (item, role); unscripted calls are fatal.
    #[derive(Default)]
    struct ScriptedJudge {
        replies: Mutex<HashMap<(String, JudgeRole), Vec<Result<Judgment, JudgeError>>>>,
        calls: Mutex<Vec<(String, JudgeRole, Vec<PriorOpinion>)>>,
    }

    impl ScriptedJudge {
        fn reply(self, item: &str, role: JudgeRole, reply: Result<Judgment, JudgeError>) -> Self {
            self.replies
                .lock()
                .unwrap()
                .entry((item.to_string(), role))
                .or_default()
                .push(reply);
            self
        }

        fn calls_for(&self, role: JudgeRole) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| c.1 == role).count()
        }
    }

    #[async_trait]
    impl JudgmentClient for ScriptedJudge {
        async fn judge(&self, request: &JudgeRequest) -> Result<Judgment, JudgeError> {
            self.calls
                .lock()
                .unwrap()
                .push((request.item.id.clone(), request.role, request.prior.clone()));
            let mut replies = self.replies.lock().unwrap();
            let queue = replies
                .get_mut(&(request.item.id.clone(), request.role))
                .filter(|q| !q.is_empty())
                .ok_or_else(|| JudgeError::Fatal("unscripted call".into()))?;
            queue.remove(0)
        }
    }

    fn verdict(decision: Decision, confidence: f64) -> Result<Judgment, JudgeError> {
        Ok(Judgment {
            decision,
            confidence,
            rationale: format!("{} at {}", decision, confidence),
            usage: Usage {
                input_tokens: 100,
                output_tokens: 10,
                cost_usd: 0.01,
            },
        })
    }

    fn settings() -> ConsensusSettings {
        let mut stage = StageConfig::screening_default();
        stage.criteria = "adults".into();
        stage.backoff_ms = 1;
        ConsensusSettings::from_config(&stage, &JudgeConfig::default())
    }

    fn limiter() -> RateLimiter {
        let mut tiers = BTreeMap::new();
        for name in ["bulk", "premium", "balanced"] {
            tiers.insert(
                name.to_string(),
                crate::config::TierConfig {
                    requests_per_interval: 1000,
                    interval_secs: 1,
                    max_in_flight: 4,
                },
            );
        }
        RateLimiter::new(&tiers)
    }

    fn engine(judge: Arc<ScriptedJudge>, store: Arc<SqliteStore>, settings: ConsensusSettings) -> ConsensusEngine {
        ConsensusEngine::new(
            WorkflowId::from("wf-1"),
            "topic",
            Phase::Screening,
            settings,
            judge,
            limiter(),
            store.clone(),
            store,
        )
    }

    fn item(id: &str) -> Item {
        Item::new(id, Phase::Screening, Document::titled(id))
    }

    #[tokio::test]
    async fn test_confident_agreement_skips_adjudicator() {
        let judge = Arc::new(
            ScriptedJudge::default()
                .reply("p1", JudgeRole::JudgeA, verdict(Decision::Include, 0.95))
                .reply("p1", JudgeRole::JudgeB, verdict(Decision::Include, 0.9)),
        );
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let result = engine(judge.clone(), store.clone(), settings())
            .evaluate(&item("p1"))
            .await
            .unwrap();

        assert!(result.agreement);
        assert!(!result.was_adjudicated());
        assert_eq!(result.final_outcome.decision, Decision::Include);
        assert_eq!(result.final_outcome.confidence, 0.9);
        assert_eq!(judge.calls_for(JudgeRole::Adjudicator), 0);

        let wf = WorkflowId::from("wf-1");
        assert!(store.has_outcome(&wf, Phase::Screening, "p1").await.unwrap());
        assert_eq!(store.outcomes_for_item(&wf, Phase::Screening, "p1").await.unwrap().len(), 3);
        assert!((store.total_cost(&wf).await.unwrap() - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_disagreement_is_adjudicated() {
        let judge = Arc::new(
            ScriptedJudge::default()
                .reply("p1", JudgeRole::JudgeA, verdict(Decision::Include, 0.95))
                .reply("p1", JudgeRole::JudgeB, verdict(Decision::Exclude, 0.9))
                .reply("p1", JudgeRole::Adjudicator, verdict(Decision::Exclude, 0.8)),
        );
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let result = engine(judge.clone(), store, settings())
            .evaluate(&item("p1"))
            .await
            .unwrap();

        assert!(!result.agreement);
        assert_eq!(result.final_outcome.decision, Decision::Exclude);
        assert_eq!(result.adjudication.unwrap().decision, Decision::Exclude);

        let calls = judge.calls.lock().unwrap();
        let adjudicator_call = calls.iter().find(|c| c.1 == JudgeRole::Adjudicator).unwrap();
        assert_eq!(adjudicator_call.2.len(), 2);
    }

    #[tokio::test]
    async fn test_low_confidence_agreement_is_adjudicated() {
        let judge = Arc::new(
            ScriptedJudge::default()
                .reply("p1", JudgeRole::JudgeA, verdict(Decision::Exclude, 0.95))
                .reply("p1", JudgeRole::JudgeB, verdict(Decision::Exclude, 0.5))
                .reply("p1", JudgeRole::Adjudicator, verdict(Decision::Include, 0.7)),
        );
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let result = engine(judge.clone(), store, settings())
            .evaluate(&item("p1"))
            .await
            .unwrap();

        assert!(result.agreement);
        assert!(result.was_adjudicated());
        assert_eq!(result.final_outcome.decision, Decision::Include);
    }

    #[tokio::test]
    async fn test_agreement_without_confidence_requirement() {
        let judge = Arc::new(
            ScriptedJudge::default()
                .reply("p1", JudgeRole::JudgeA, verdict(Decision::Exclude, 0.3))
                .reply("p1", JudgeRole::JudgeB, verdict(Decision::Exclude, 0.2)),
        );
        let mut settings = settings();
        settings.require_confidence = false;
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let result = engine(judge.clone(), store, settings)
            .evaluate(&item("p1"))
            .await
            .unwrap();
        assert!(!result.was_adjudicated());
        assert_eq!(judge.calls_for(JudgeRole::Adjudicator), 0);
    }

    #[tokio::test]
    async fn test_failed_reviewer_retries_then_escalates() {
        let judge = Arc::new(
            ScriptedJudge::default()
                .reply("p1", JudgeRole::JudgeA, verdict(Decision::Include, 0.95))
                .reply("p1", JudgeRole::JudgeB, Err(JudgeError::Timeout(Duration::from_secs(1))))
                .reply("p1", JudgeRole::JudgeB, Err(JudgeError::Timeout(Duration::from_secs(1))))
                .reply("p1", JudgeRole::Adjudicator, verdict(Decision::Include, 0.85)),
        );
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let result = engine(judge.clone(), store.clone(), settings())
            .evaluate(&item("p1"))
            .await
            .unwrap();

        assert_eq!(judge.calls_for(JudgeRole::JudgeB), 2);
        assert!(result.reviewer_b.is_none());
        assert!(result.final_outcome.rationale.contains("no second opinion available"));

        let calls = judge.calls.lock().unwrap();
        let prior = &calls.iter().find(|c| c.1 == JudgeRole::Adjudicator).unwrap().2;
        assert_eq!(prior[1].decision, None);

        // No B row is ever invented.
        let rows = store
            .outcomes_for_item(&WorkflowId::from("wf-1"), Phase::Screening, "p1")
            .await
            .unwrap();
        assert!(rows.iter().all(|o| o.actor != Actor::JudgeB));
    }

    #[tokio::test]
    async fn test_fatal_judge_error_aborts_item() {
        let judge = Arc::new(
            ScriptedJudge::default()
                .reply("p1", JudgeRole::JudgeA, verdict(Decision::Include, 0.95))
                .reply("p1", JudgeRole::JudgeB, Err(JudgeError::Fatal("bad request".into()))),
        );
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let err = engine(judge, store.clone(), settings())
            .evaluate(&item("p1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FatalCall { actor: Actor::JudgeB, .. }));

        // A's completed call is still durable.
        let rows = store
            .outcomes_for_item(&WorkflowId::from("wf-1"), Phase::Screening, "p1")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].actor, Actor::JudgeA);
    }

    #[tokio::test]
    async fn test_persisted_reviewer_is_not_called_again() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let wf = WorkflowId::from("wf-1");
        store
            .record_outcome(&ItemOutcome::new(
                &wf,
                Phase::Screening,
                "p1",
                Actor::JudgeA,
                Decision::Include,
                0.95,
                "from an earlier run",
            ))
            .await
            .unwrap();

        let judge = Arc::new(ScriptedJudge::default().reply("p1", JudgeRole::JudgeB, verdict(Decision::Include, 0.9)));
        let result = engine(judge.clone(), store.clone(), settings())
            .evaluate(&item("p1"))
            .await
            .unwrap();

        assert_eq!(judge.calls_for(JudgeRole::JudgeA), 0);
        assert_eq!(result.reviewer_a.unwrap().rationale, "from an earlier run");
        assert_eq!(store.count_outcomes(&wf, Phase::Screening, Actor::JudgeA).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_single_review_uses_one_judge() {
        let judge = Arc::new(ScriptedJudge::default().reply("p1", JudgeRole::JudgeA, verdict(Decision::Include, 0.6)));
        let mut stage = StageConfig::extraction_default();
        stage.criteria = "data".into();
        let settings = ConsensusSettings::from_config(&stage, &JudgeConfig::default());
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let result = engine(judge.clone(), store, settings)
            .evaluate(&item("p1"))
            .await
            .unwrap();
        assert_eq!(judge.calls_for(JudgeRole::JudgeB), 0);
        assert!(!result.was_adjudicated());
        assert_eq!(result.final_outcome.decision, Decision::Include);
    }

    #[tokio::test]
    async fn test_both_reviewers_failing_leaves_item_undecided() {
        let timeout = || Err(JudgeError::Throttled("429".into()));
        let judge = Arc::new(
            ScriptedJudge::default()
                .reply("p1", JudgeRole::JudgeA, timeout())
                .reply("p1", JudgeRole::JudgeA, timeout())
                .reply("p1", JudgeRole::JudgeB, timeout())
                .reply("p1", JudgeRole::JudgeB, timeout()),
        );
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let err = engine(judge.clone(), store.clone(), settings())
            .evaluate(&item("p1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TransientCall { .. }));
        assert_eq!(judge.calls_for(JudgeRole::Adjudicator), 0);
        assert!(!store.has_outcome(&WorkflowId::from("wf-1"), Phase::Screening, "p1").await.unwrap());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts, 1);
    }
}
