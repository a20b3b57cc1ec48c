//! Cross-run index of workflows by topic and configuration hash.
//!
//! Lives at `<data_dir>/registry.db`, separate from the per-workflow
//! databases, so a workflow can be located before its own store is opened.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysrev_common::WorkflowId;

use super::parse_timestamp;
use crate::errors::StoreError;

pub const REGISTRY_FILE: &str = "registry.db";

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub workflow_id: WorkflowId,
    pub topic: String,
    pub config_hash: String,
    /// Directory holding the workflow's `state.db` and artifacts.
    pub location: PathBuf,
    pub created_at: DateTime<Utc>,
}

pub struct Registry {
    conn: Connection,
}

impl Registry {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir).map_err(|source| StoreError::Io {
            path: data_dir.to_path_buf(),
            source,
        })?;
        let conn = Connection::open(data_dir.join(REGISTRY_FILE))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS registry (
                workflow_id TEXT PRIMARY KEY,
                topic TEXT NOT NULL,
                config_hash TEXT NOT NULL,
                location TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_registry_topic ON registry(topic, config_hash);
            ",
        )?;
        Ok(Self { conn })
    }

    pub fn register(&self, entry: &RegistryEntry) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO registry (workflow_id, topic, config_hash, location, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.workflow_id.as_str(),
                entry.topic,
                entry.config_hash,
                entry.location.to_string_lossy(),
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent workflow started with exactly this topic and hash.
    pub fn find(&self, topic: &str, config_hash: &str) -> Result<Option<RegistryEntry>, StoreError> {
        Ok(self
            .query(
                "SELECT workflow_id, topic, config_hash, location, created_at FROM registry
                 WHERE topic = ?1 AND config_hash = ?2 ORDER BY created_at DESC LIMIT 1",
                params![topic, config_hash],
            )?
            .into_iter()
            .next())
    }

    /// All workflows for a topic, newest first.
    pub fn find_by_topic(&self, topic: &str) -> Result<Vec<RegistryEntry>, StoreError> {
        self.query(
            "SELECT workflow_id, topic, config_hash, location, created_at FROM registry
             WHERE topic = ?1 ORDER BY created_at DESC",
            params![topic],
        )
    }

    pub fn find_by_id(&self, workflow_id: &WorkflowId) -> Result<Option<RegistryEntry>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT workflow_id, topic, config_hash, location, created_at FROM registry
                 WHERE workflow_id = ?1",
                params![workflow_id.as_str()],
                read_row,
            )
            .optional()?;
        row.map(decode).transpose()
    }

    fn query(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<RegistryEntry>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode).collect()
    }
}

type RegistryRow = (String, String, String, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegistryRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode((id, topic, config_hash, location, created_at): RegistryRow) -> Result<RegistryEntry, StoreError> {
    Ok(RegistryEntry {
        workflow_id: WorkflowId::from(id),
        topic,
        config_hash,
        location: PathBuf::from(location),
        created_at: parse_timestamp(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(id: &str, topic: &str, hash: &str, age_secs: i64) -> RegistryEntry {
        RegistryEntry {
            workflow_id: WorkflowId::from(id),
            topic: topic.into(),
            config_hash: hash.into(),
            location: PathBuf::from(format!("/data/workflows/{}", id)),
            created_at: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_find_matches_topic_and_hash() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();
        registry.register(&entry("wf-old", "statins", "h1", 60)).unwrap();
        registry.register(&entry("wf-new", "statins", "h1", 0)).unwrap();
        registry.register(&entry("wf-other", "statins", "h2", 0)).unwrap();

        let found = registry.find("statins", "h1").unwrap().unwrap();
        assert_eq!(found.workflow_id.as_str(), "wf-new");
        assert!(registry.find("statins", "h3").unwrap().is_none());
        assert_eq!(registry.find_by_topic("statins").unwrap().len(), 3);
    }

    #[test]
    fn test_registry_persists_across_opens() {
        let dir = tempdir().unwrap();
        Registry::open(dir.path())
            .unwrap()
            .register(&entry("wf-1", "t", "h", 0))
            .unwrap();
        let reopened = Registry::open(dir.path()).unwrap();
        let found = reopened.find_by_id(&WorkflowId::from("wf-1")).unwrap().unwrap();
        assert_eq!(found.location, PathBuf::from("/data/workflows/wf-1"));
    }
}
