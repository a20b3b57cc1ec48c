//! Append-only ledger of external judgment calls.

use async_trait::async_trait;
use rusqlite::params;
use sysrev_common::{CostUnit, Phase, WorkflowId};

use super::SqliteStore;
use crate::errors::StoreError;

/// Aggregated spend for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseCost {
    pub phase: Phase,
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[async_trait]
pub trait CostLedger: Send + Sync {
    async fn record_cost(&self, unit: &CostUnit) -> Result<(), StoreError>;

    async fn total_cost(&self, workflow_id: &WorkflowId) -> Result<f64, StoreError>;

    /// Per-phase totals in phase order.
    async fn cost_by_phase(&self, workflow_id: &WorkflowId) -> Result<Vec<PhaseCost>, StoreError>;
}

#[async_trait]
impl CostLedger for SqliteStore {
    async fn record_cost(&self, unit: &CostUnit) -> Result<(), StoreError> {
        let unit = unit.clone();
        self.handle()
            .write(move |db| {
                db.conn().execute(
                    "INSERT INTO cost_units
                     (workflow_id, phase, tier, actor, item_id, input_tokens, output_tokens, cost_usd, latency_ms, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        unit.workflow_id.as_str(),
                        unit.phase.as_str(),
                        unit.tier.as_str(),
                        unit.actor.as_str(),
                        unit.item_id,
                        unit.usage.input_tokens as i64,
                        unit.usage.output_tokens as i64,
                        unit.usage.cost_usd,
                        unit.latency_ms as i64,
                        unit.recorded_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn total_cost(&self, workflow_id: &WorkflowId) -> Result<f64, StoreError> {
        let wf = workflow_id.to_string();
        self.handle()
            .call(move |db| {
                let total: f64 = db.conn().query_row(
                    "SELECT COALESCE(SUM(cost_usd), 0.0) FROM cost_units WHERE workflow_id = ?1",
                    params![wf],
                    |row| row.get(0),
                )?;
                Ok(total)
            })
            .await
    }

    async fn cost_by_phase(&self, workflow_id: &WorkflowId) -> Result<Vec<PhaseCost>, StoreError> {
        let wf = workflow_id.to_string();
        self.handle()
            .call(move |db| {
                let mut stmt = db.conn().prepare(
                    "SELECT phase, COUNT(*), SUM(input_tokens), SUM(output_tokens), SUM(cost_usd)
                     FROM cost_units WHERE workflow_id = ?1 GROUP BY phase",
                )?;
                let rows = stmt
                    .query_map(params![wf], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, f64>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                let mut costs = rows
                    .into_iter()
                    .map(|(phase, calls, input, output, cost)| {
                        Ok(PhaseCost {
                            phase: phase.parse()?,
                            calls: calls as u64,
                            input_tokens: input as u64,
                            output_tokens: output as u64,
                            cost_usd: cost,
                        })
                    })
                    .collect::<Result<Vec<_>, StoreError>>()?;
                costs.sort_by_key(|c| c.phase.index());
                Ok(costs)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sysrev_common::{Actor, Tier, Usage};

    fn unit(wf: &WorkflowId, phase: Phase, cost: f64) -> CostUnit {
        CostUnit {
            workflow_id: wf.clone(),
            phase,
            tier: Tier::new("bulk"),
            actor: Actor::JudgeA,
            item_id: Some("p1".into()),
            usage: Usage {
                input_tokens: 100,
                output_tokens: 20,
                cost_usd: cost,
            },
            latency_ms: 350,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_total_cost_starts_at_zero() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.total_cost(&WorkflowId::from("wf-1")).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_costs_aggregate_by_phase() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = WorkflowId::from("wf-1");
        store.record_cost(&unit(&wf, Phase::Extraction, 0.25)).await.unwrap();
        store.record_cost(&unit(&wf, Phase::Screening, 0.5)).await.unwrap();
        store.record_cost(&unit(&wf, Phase::Screening, 0.25)).await.unwrap();
        store
            .record_cost(&unit(&WorkflowId::from("wf-2"), Phase::Screening, 9.0))
            .await
            .unwrap();

        assert!((store.total_cost(&wf).await.unwrap() - 1.0).abs() < 1e-9);

        let by_phase = store.cost_by_phase(&wf).await.unwrap();
        assert_eq!(by_phase.len(), 2);
        assert_eq!(by_phase[0].phase, Phase::Screening);
        assert_eq!(by_phase[0].calls, 2);
        assert_eq!(by_phase[0].input_tokens, 200);
        assert_eq!(by_phase[1].phase, Phase::Extraction);
    }
}
