//! Durable per-item outcomes and the per-stage work queue.

use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};
use std::collections::HashSet;
use sysrev_common::{Actor, Document, Item, ItemOutcome, Phase, WorkflowId};

use super::{SqliteStore, now_rfc3339, outcome_table, parse_timestamp};
use crate::errors::StoreError;

/// Result of an append-only outcome write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Inserted,
    /// A row for the same (stage, item, actor) already existed and was kept.
    Duplicate,
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// True once the item has a binding `Final` outcome for the stage.
    async fn has_outcome(
        &self,
        workflow_id: &WorkflowId,
        stage: Phase,
        item_id: &str,
    ) -> Result<bool, StoreError>;

    /// Durably append an outcome. Returns only after the row is committed.
    async fn record_outcome(&self, outcome: &ItemOutcome) -> Result<RecordStatus, StoreError>;

    /// Item IDs with a `Final` outcome for the stage.
    async fn processed_ids(
        &self,
        workflow_id: &WorkflowId,
        stage: Phase,
    ) -> Result<HashSet<String>, StoreError>;

    async fn outcomes_for_item(
        &self,
        workflow_id: &WorkflowId,
        stage: Phase,
        item_id: &str,
    ) -> Result<Vec<ItemOutcome>, StoreError>;

    /// All `Final` rows for the stage in enqueue order.
    async fn final_outcomes(
        &self,
        workflow_id: &WorkflowId,
        stage: Phase,
    ) -> Result<Vec<ItemOutcome>, StoreError>;

    async fn count_outcomes(
        &self,
        workflow_id: &WorkflowId,
        stage: Phase,
        actor: Actor,
    ) -> Result<u64, StoreError>;

    /// Queue items for their stage. Already-queued IDs are left untouched;
    /// returns how many were newly added.
    async fn enqueue_items(&self, workflow_id: &WorkflowId, items: &[Item]) -> Result<usize, StoreError>;

    /// Queued items for the stage in enqueue order.
    async fn items(&self, workflow_id: &WorkflowId, stage: Phase) -> Result<Vec<Item>, StoreError>;
}

type OutcomeRow = (String, String, String, f64, String, String);

fn decode_outcome(workflow_id: &WorkflowId, stage: Phase, row: OutcomeRow) -> Result<ItemOutcome, StoreError> {
    let (item_id, actor, decision, confidence, rationale, recorded_at) = row;
    Ok(ItemOutcome {
        workflow_id: workflow_id.clone(),
        stage,
        item_id,
        actor: actor.parse()?,
        decision: decision.parse()?,
        confidence,
        rationale,
        recorded_at: parse_timestamp(&recorded_at)?,
    })
}

fn read_outcome_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutcomeRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

#[async_trait]
impl ItemStore for SqliteStore {
    async fn has_outcome(
        &self,
        workflow_id: &WorkflowId,
        stage: Phase,
        item_id: &str,
    ) -> Result<bool, StoreError> {
        let table = outcome_table(stage)?;
        let wf = workflow_id.to_string();
        let item_id = item_id.to_string();
        self.handle()
            .call(move |db| {
                let found = db
                    .conn()
                    .query_row(
                        &format!(
                            "SELECT 1 FROM {table} WHERE workflow_id = ?1 AND stage = ?2 AND item_id = ?3 AND actor = ?4"
                        ),
                        params![wf, stage.as_str(), item_id, Actor::Final.as_str()],
                        |_| Ok(()),
                    )
                    .optional()?;
                Ok(found.is_some())
            })
            .await
    }

    async fn record_outcome(&self, outcome: &ItemOutcome) -> Result<RecordStatus, StoreError> {
        let table = outcome_table(outcome.stage)?;
        let outcome = outcome.clone();
        self.handle()
            .write(move |db| {
                let changed = db.conn().execute(
                    &format!(
                        "INSERT OR IGNORE INTO {table}
                         (workflow_id, stage, item_id, actor, decision, confidence, rationale, recorded_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                    ),
                    params![
                        outcome.workflow_id.as_str(),
                        outcome.stage.as_str(),
                        outcome.item_id,
                        outcome.actor.as_str(),
                        outcome.decision.as_str(),
                        outcome.confidence,
                        outcome.rationale,
                        outcome.recorded_at.to_rfc3339(),
                    ],
                )?;
                Ok(if changed == 1 {
                    RecordStatus::Inserted
                } else {
                    RecordStatus::Duplicate
                })
            })
            .await
    }

    async fn processed_ids(
        &self,
        workflow_id: &WorkflowId,
        stage: Phase,
    ) -> Result<HashSet<String>, StoreError> {
        let table = outcome_table(stage)?;
        let wf = workflow_id.to_string();
        self.handle()
            .call(move |db| {
                let mut stmt = db.conn().prepare(&format!(
                    "SELECT item_id FROM {table} WHERE workflow_id = ?1 AND stage = ?2 AND actor = ?3"
                ))?;
                let ids = stmt
                    .query_map(params![wf, stage.as_str(), Actor::Final.as_str()], |row| {
                        row.get::<_, String>(0)
                    })?
                    .collect::<Result<HashSet<_>, _>>()?;
                Ok(ids)
            })
            .await
    }

    async fn outcomes_for_item(
        &self,
        workflow_id: &WorkflowId,
        stage: Phase,
        item_id: &str,
    ) -> Result<Vec<ItemOutcome>, StoreError> {
        let table = outcome_table(stage)?;
        let wf = workflow_id.clone();
        let item_id = item_id.to_string();
        self.handle()
            .call(move |db| {
                let mut stmt = db.conn().prepare(&format!(
                    "SELECT item_id, actor, decision, confidence, rationale, recorded_at
                     FROM {table} WHERE workflow_id = ?1 AND stage = ?2 AND item_id = ?3
                     ORDER BY recorded_at"
                ))?;
                let rows = stmt
                    .query_map(params![wf.as_str(), stage.as_str(), item_id], read_outcome_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|row| decode_outcome(&wf, stage, row))
                    .collect()
            })
            .await
    }

    async fn final_outcomes(
        &self,
        workflow_id: &WorkflowId,
        stage: Phase,
    ) -> Result<Vec<ItemOutcome>, StoreError> {
        let table = outcome_table(stage)?;
        let wf = workflow_id.clone();
        self.handle()
            .call(move |db| {
                let mut stmt = db.conn().prepare(&format!(
                    "SELECT o.item_id, o.actor, o.decision, o.confidence, o.rationale, o.recorded_at
                     FROM {table} o
                     LEFT JOIN items i
                       ON i.workflow_id = o.workflow_id AND i.stage = o.stage AND i.item_id = o.item_id
                     WHERE o.workflow_id = ?1 AND o.stage = ?2 AND o.actor = ?3
                     ORDER BY i.seq, o.item_id"
                ))?;
                let rows = stmt
                    .query_map(
                        params![wf.as_str(), stage.as_str(), Actor::Final.as_str()],
                        read_outcome_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|row| decode_outcome(&wf, stage, row))
                    .collect()
            })
            .await
    }

    async fn count_outcomes(
        &self,
        workflow_id: &WorkflowId,
        stage: Phase,
        actor: Actor,
    ) -> Result<u64, StoreError> {
        let table = outcome_table(stage)?;
        let wf = workflow_id.to_string();
        self.handle()
            .call(move |db| {
                let count: i64 = db.conn().query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {table} WHERE workflow_id = ?1 AND stage = ?2 AND actor = ?3"
                    ),
                    params![wf, stage.as_str(), actor.as_str()],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
    }

    async fn enqueue_items(&self, workflow_id: &WorkflowId, items: &[Item]) -> Result<usize, StoreError> {
        let wf = workflow_id.to_string();
        let rows = items
            .iter()
            .map(|item| Ok((item.id.clone(), item.stage, serde_json::to_string(&item.payload)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        self.handle()
            .write(move |db| {
                let tx = db.conn().unchecked_transaction()?;
                let mut added = 0;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO items (workflow_id, stage, item_id, payload, seq, enqueued_at)
                         VALUES (?1, ?2, ?3, ?4,
                                 (SELECT COALESCE(MAX(seq), 0) + 1 FROM items WHERE workflow_id = ?1 AND stage = ?2),
                                 ?5)",
                    )?;
                    let now = now_rfc3339();
                    for (item_id, stage, payload) in &rows {
                        added += stmt.execute(params![wf, stage.as_str(), item_id, payload, now])?;
                    }
                }
                tx.commit()?;
                Ok(added)
            })
            .await
    }

    async fn items(&self, workflow_id: &WorkflowId, stage: Phase) -> Result<Vec<Item>, StoreError> {
        let wf = workflow_id.to_string();
        self.handle()
            .call(move |db| {
                let mut stmt = db.conn().prepare(
                    "SELECT item_id, payload FROM items WHERE workflow_id = ?1 AND stage = ?2 ORDER BY seq",
                )?;
                let rows = stmt
                    .query_map(params![wf, stage.as_str()], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|(id, payload)| {
                        let doc: Document = serde_json::from_str(&payload)?;
                        Ok(Item::new(&id, stage, doc))
                    })
                    .collect()
            })
            .await
    }
}
