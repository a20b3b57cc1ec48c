//! Phase-level progress markers.

use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};
use sysrev_common::{Checkpoint, CheckpointStatus, Phase, WorkflowId};

use super::{SqliteStore, now_rfc3339, parse_timestamp};
use crate::errors::StoreError;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The checkpoint of the furthest phase in phase order, whatever its status.
    async fn last_completed_phase(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<Checkpoint>, StoreError>;

    async fn checkpoint(
        &self,
        workflow_id: &WorkflowId,
        phase: Phase,
    ) -> Result<Option<Checkpoint>, StoreError>;

    /// Every checkpoint for the workflow, sorted by phase order.
    async fn checkpoints(&self, workflow_id: &WorkflowId) -> Result<Vec<Checkpoint>, StoreError>;

    /// Upsert the checkpoint for a phase. A `completed` checkpoint never
    /// regresses to `partial`.
    async fn write_checkpoint(
        &self,
        workflow_id: &WorkflowId,
        phase: Phase,
        status: CheckpointStatus,
        items_processed: u64,
    ) -> Result<(), StoreError>;
}

fn decode(
    workflow_id: &WorkflowId,
    (phase, status, items_processed, updated_at): (String, String, i64, String),
) -> Result<Checkpoint, StoreError> {
    Ok(Checkpoint {
        workflow_id: workflow_id.clone(),
        phase: phase.parse()?,
        status: status.parse()?,
        items_processed: items_processed.max(0) as u64,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn last_completed_phase(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.checkpoints(workflow_id).await?.pop())
    }

    async fn checkpoint(
        &self,
        workflow_id: &WorkflowId,
        phase: Phase,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let wf = workflow_id.clone();
        self.handle()
            .call(move |db| {
                let row = db
                    .conn()
                    .query_row(
                        "SELECT phase, status, items_processed, updated_at
                         FROM checkpoints WHERE workflow_id = ?1 AND phase = ?2",
                        params![wf.as_str(), phase.as_str()],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .optional()?;
                row.map(|r| decode(&wf, r)).transpose()
            })
            .await
    }

    async fn checkpoints(&self, workflow_id: &WorkflowId) -> Result<Vec<Checkpoint>, StoreError> {
        let wf = workflow_id.clone();
        self.handle()
            .call(move |db| {
                let mut stmt = db.conn().prepare(
                    "SELECT phase, status, items_processed, updated_at
                     FROM checkpoints WHERE workflow_id = ?1",
                )?;
                let rows = stmt
                    .query_map(params![wf.as_str()], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                let mut checkpoints = rows
                    .into_iter()
                    .map(|r| decode(&wf, r))
                    .collect::<Result<Vec<_>, _>>()?;
                checkpoints.sort_by_key(|c| c.phase.index());
                Ok(checkpoints)
            })
            .await
    }

    async fn write_checkpoint(
        &self,
        workflow_id: &WorkflowId,
        phase: Phase,
        status: CheckpointStatus,
        items_processed: u64,
    ) -> Result<(), StoreError> {
        let wf = workflow_id.to_string();
        self.handle()
            .write(move |db| {
                let tx = db.conn().unchecked_transaction()?;
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT status FROM checkpoints WHERE workflow_id = ?1 AND phase = ?2",
                        params![wf, phase.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(existing) = existing
                    && existing.parse::<CheckpointStatus>()? == CheckpointStatus::Completed
                    && status == CheckpointStatus::Partial
                {
                    return Err(StoreError::CheckpointRegression { phase });
                }

                let now = now_rfc3339();
                tx.execute(
                    "INSERT INTO checkpoints (workflow_id, phase, status, items_processed, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(workflow_id, phase) DO UPDATE SET
                        status = excluded.status,
                        items_processed = excluded.items_processed,
                        updated_at = excluded.updated_at",
                    params![wf, phase.as_str(), status.as_str(), items_processed as i64, now],
                )?;
                tx.execute(
                    "UPDATE workflows SET updated_at = ?2 WHERE workflow_id = ?1",
                    params![wf, now],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_checkpoints_for_new_workflow() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = WorkflowId::from("wf-1");
        assert!(store.last_completed_phase(&wf).await.unwrap().is_none());
        assert!(store.checkpoints(&wf).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_phase_follows_phase_order_not_write_order() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = WorkflowId::from("wf-1");
        store
            .write_checkpoint(&wf, Phase::Screening, CheckpointStatus::Partial, 6)
            .await
            .unwrap();
        store
            .write_checkpoint(&wf, Phase::Search, CheckpointStatus::Completed, 10)
            .await
            .unwrap();

        let last = store.last_completed_phase(&wf).await.unwrap().unwrap();
        assert_eq!(last.phase, Phase::Screening);
        assert_eq!(last.status, CheckpointStatus::Partial);
        assert_eq!(last.items_processed, 6);
    }

    #[tokio::test]
    async fn test_partial_upgrades_to_completed() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = WorkflowId::from("wf-1");
        store
            .write_checkpoint(&wf, Phase::Screening, CheckpointStatus::Partial, 6)
            .await
            .unwrap();
        store
            .write_checkpoint(&wf, Phase::Screening, CheckpointStatus::Completed, 10)
            .await
            .unwrap();
        let cp = store.checkpoint(&wf, Phase::Screening).await.unwrap().unwrap();
        assert!(cp.is_completed());
        assert_eq!(cp.items_processed, 10);
    }

    #[tokio::test]
    async fn test_completed_never_regresses() {
        let store = SqliteStore::in_memory().unwrap();
        let wf = WorkflowId::from("wf-1");
        store
            .write_checkpoint(&wf, Phase::Screening, CheckpointStatus::Completed, 10)
            .await
            .unwrap();
        let err = store
            .write_checkpoint(&wf, Phase::Screening, CheckpointStatus::Partial, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CheckpointRegression { phase: Phase::Screening }));

        let cp = store.checkpoint(&wf, Phase::Screening).await.unwrap().unwrap();
        assert_eq!(cp.items_processed, 10);
    }

    #[tokio::test]
    async fn test_unknown_phase_name_is_a_decode_error() {
        let store = SqliteStore::in_memory().unwrap();
        {
            let guard = store.handle().lock_sync().unwrap();
            guard
                .conn()
                .execute(
                    "INSERT INTO checkpoints VALUES ('wf-1', 'peer_review', 'completed', 0, ?1)",
                    [now_rfc3339()],
                )
                .unwrap();
        }
        let err = store.checkpoints(&WorkflowId::from("wf-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Decode(ref m) if m.contains("peer_review")));
    }
}
