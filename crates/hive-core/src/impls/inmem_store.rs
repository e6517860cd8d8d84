//! InMemoryTaskStore - テスト・組み込み用の TaskStore

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{HiveError, TaskId, TaskPatch, TaskRecord};
use crate::ports::TaskStore;

/// BTreeMap で task_id 順に保持する。clone は同じ中身を共有する。
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    records: Arc<Mutex<BTreeMap<TaskId, TaskRecord>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同じ task_id が複数あれば後勝ち
    pub fn with_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = TaskRecord>,
    {
        let map = records
            .into_iter()
            .map(|record| (record.task_id.clone(), record))
            .collect();
        Self {
            records: Arc::new(Mutex::new(map)),
        }
    }

    pub async fn insert(&self, record: TaskRecord) -> Result<(), HiveError> {
        record.validate()?;
        self.records
            .lock()
            .await
            .insert(record.task_id.clone(), record);
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn list_all(&self) -> Result<Vec<TaskRecord>, HiveError> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn read(&self, task_id: &TaskId) -> Result<TaskRecord, HiveError> {
        self.records
            .lock()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| HiveError::NotFound(format!("task {task_id}")))
    }

    async fn write(&self, task_id: &TaskId, patch: TaskPatch) -> Result<(), HiveError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(task_id)
            .ok_or_else(|| HiveError::NotFound(format!("task {task_id}")))?;
        record.apply(patch);
        Ok(())
    }

    async fn claim_owner(
        &self,
        task_id: &TaskId,
        patch: TaskPatch,
    ) -> Result<Option<String>, HiveError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(task_id)
            .ok_or_else(|| HiveError::NotFound(format!("task {task_id}")))?;
        if let Some(current) = &record.owner {
            return Ok(Some(current.clone()));
        }
        record.apply(patch);
        Ok(None)
    }
}
