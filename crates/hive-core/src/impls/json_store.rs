//! JsonFileTaskStore - JSON ファイルを正本にする TaskStore
//!
//! ファイルは TaskRecord の配列（`{"tasks": [...]}` 形式も読める）。
//! 書き込みは mutex の下で read-modify-write し、一時ファイル経由の rename で置き換える。
//! mutex はプロセス内だけの排他なので、プロセス間の排他は lease コーディネーターに任せる。

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{HiveError, TaskId, TaskPatch, TaskRecord};
use crate::ports::TaskStore;

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    List(Vec<TaskRecord>),
    Wrapped { tasks: Vec<TaskRecord> },
}

pub struct JsonFileTaskStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<TaskRecord>, HiveError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            HiveError::Store(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let records = match serde_json::from_str::<TaskFile>(&raw).map_err(|e| {
            HiveError::Store(format!("cannot parse {}: {e}", self.path.display()))
        })? {
            TaskFile::List(records) | TaskFile::Wrapped { tasks: records } => records,
        };

        let mut seen = HashSet::new();
        for record in &records {
            record.validate()?;
            if !seen.insert(&record.task_id) {
                return Err(HiveError::Validation(format!(
                    "duplicate task_id {} in {}",
                    record.task_id,
                    self.path.display()
                )));
            }
        }
        Ok(records)
    }

    async fn save(&self, records: &[TaskRecord]) -> Result<(), HiveError> {
        let body = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await.map_err(|e| {
            HiveError::Store(format!("cannot write {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            HiveError::Store(format!("cannot replace {}: {e}", self.path.display()))
        })?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonFileTaskStore {
    async fn list_all(&self) -> Result<Vec<TaskRecord>, HiveError> {
        self.load().await
    }

    async fn read(&self, task_id: &TaskId) -> Result<TaskRecord, HiveError> {
        self.load()
            .await?
            .into_iter()
            .find(|record| record.task_id == *task_id)
            .ok_or_else(|| HiveError::NotFound(format!("task {task_id}")))
    }

    async fn write(&self, task_id: &TaskId, patch: TaskPatch) -> Result<(), HiveError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        let record = records
            .iter_mut()
            .find(|record| record.task_id == *task_id)
            .ok_or_else(|| HiveError::NotFound(format!("task {task_id}")))?;
        record.apply(patch);
        self.save(&records).await?;
        debug!(task_id = %task_id, path = %self.path.display(), "task record written");
        Ok(())
    }

    async fn claim_owner(
        &self,
        task_id: &TaskId,
        patch: TaskPatch,
    ) -> Result<Option<String>, HiveError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        let record = records
            .iter_mut()
            .find(|record| record.task_id == *task_id)
            .ok_or_else(|| HiveError::NotFound(format!("task {task_id}")))?;
        if let Some(current) = &record.owner {
            return Ok(Some(current.clone()));
        }
        record.apply(patch);
        self.save(&records).await?;
        debug!(task_id = %task_id, path = %self.path.display(), "task owner claimed");
        Ok(None)
    }
}
