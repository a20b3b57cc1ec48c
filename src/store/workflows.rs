//! Workflow rows.

use rusqlite::{OptionalExtension, params};
use sysrev_common::{Workflow, WorkflowId, WorkflowStatus};

use super::{SqliteStore, now_rfc3339, parse_timestamp};
use crate::errors::StoreError;

impl SqliteStore {
    /// Insert the workflow row if it does not exist yet.
    pub async fn create_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let wf = workflow.clone();
        self.handle()
            .write(move |db| {
                db.conn().execute(
                    "INSERT OR IGNORE INTO workflows (workflow_id, topic, config_hash, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        wf.id.as_str(),
                        wf.topic,
                        wf.config_hash,
                        wf.status.as_str(),
                        wf.created_at.to_rfc3339(),
                        wf.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn load_workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>, StoreError> {
        let id = id.clone();
        self.handle()
            .call(move |db| {
                let row = db
                    .conn()
                    .query_row(
                        "SELECT topic, config_hash, status, created_at, updated_at
                         FROM workflows WHERE workflow_id = ?1",
                        params![id.as_str()],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                                row.get::<_, String>(4)?,
                            ))
                        },
                    )
                    .optional()?;
                row.map(|(topic, config_hash, status, created_at, updated_at)| {
                    Ok(Workflow {
                        id: id.clone(),
                        topic,
                        config_hash,
                        status: status.parse()?,
                        created_at: parse_timestamp(&created_at)?,
                        updated_at: parse_timestamp(&updated_at)?,
                    })
                })
                .transpose()
            })
            .await
    }

    pub async fn set_workflow_status(
        &self,
        id: &WorkflowId,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        self.handle()
            .write(move |db| {
                db.conn().execute(
                    "UPDATE workflows SET status = ?2, updated_at = ?3 WHERE workflow_id = ?1",
                    params![id, status.as_str(), now_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }
}
