//! Durable state: per-item outcomes, phase checkpoints, workflow rows, cost
//! ledger, and the cross-run registry.
//!
//! Each workflow owns one SQLite database (`workflows/<id>/state.db`). The
//! stores are exposed as traits so the orchestrator can be driven against
//! fakes in tests; `SqliteStore` implements all of them over one handle.

pub mod checkpoints;
pub mod costs;
pub mod db;
pub mod items;
pub mod registry;
pub mod workflows;

pub use checkpoints::CheckpointStore;
pub use costs::{CostLedger, PhaseCost};
pub use db::{DbHandle, WorkflowDb};
pub use items::{ItemStore, RecordStatus};
pub use registry::{Registry, RegistryEntry};

use chrono::{DateTime, Utc};
use std::path::Path;
use sysrev_common::Phase;

use crate::errors::StoreError;

/// SQLite implementation of every workflow-scoped store.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbHandle,
}

impl SqliteStore {
    /// Open or create the database at `path`, running migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            db: DbHandle::new(WorkflowDb::open(path)?),
        })
    }

    /// Open a database that must already exist. Tables are not created, so a
    /// missing outcome table surfaces through [`Self::verify_schema`].
    pub fn open_existing(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            db: DbHandle::new(WorkflowDb::open_existing(path)?),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            db: DbHandle::new(WorkflowDb::open_in_memory()?),
        })
    }

    pub fn handle(&self) -> &DbHandle {
        &self.db
    }

    /// Fail with `MissingTable` if any table resume depends on is absent.
    pub async fn verify_schema(&self) -> Result<(), StoreError> {
        self.db
            .call(|db| {
                let mut required = vec!["workflows", "checkpoints", "items", "cost_units"];
                required.extend(Phase::ALL.iter().filter_map(|p| p.outcome_table()));
                for table in required {
                    if !db.table_exists(table)? {
                        return Err(StoreError::MissingTable(table.to_string()));
                    }
                }
                Ok(())
            })
            .await
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("bad timestamp '{}': {}", raw, e)))
}

pub(crate) fn outcome_table(stage: Phase) -> Result<&'static str, StoreError> {
    stage
        .outcome_table()
        .ok_or_else(|| StoreError::MissingTable(format!("outcomes_{}", stage)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_verify_schema_on_fresh_store() {
        let store = SqliteStore::in_memory().unwrap();
        store.verify_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_schema_detects_dropped_outcome_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            let guard = store.handle().lock_sync().unwrap();
            guard
                .conn()
                .execute_batch("DROP TABLE outcomes_extraction;")
                .unwrap();
        }
        let store = SqliteStore::open_existing(&path).unwrap();
        let err = store.verify_schema().await.unwrap_err();
        assert!(matches!(err, StoreError::MissingTable(ref t) if t == "outcomes_extraction"));
    }

    #[test]
    fn test_outcome_table_rejects_non_item_phase() {
        assert_eq!(outcome_table(Phase::Screening).unwrap(), "outcomes_screening");
        assert!(outcome_table(Phase::Writing).is_err());
    }
}
