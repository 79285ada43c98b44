// ==========================================
// 价目表导入系统 - 上传任务 Repository 实现
// ==========================================
// SqliteUploadJobRepository: upload_job（检查点 JSON）+ upload_status_log
// InMemoryUploadJobStore: 无持久化场景 / 测试
// ==========================================

use crate::domain::price_list::{JobCheckpoint, UploadJob};
use crate::domain::types::UploadStatus;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::upload_job_repo::{StatusStore, UploadCheckpointStore};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

// ==========================================
// SQLite 实现
// ==========================================
pub struct SqliteUploadJobRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteUploadJobRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        let repo = Self { conn };
        {
            let conn = repo.get_conn()?;
            crate::db::ensure_schema(&conn)?;
        }
        Ok(repo)
    }

    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(format!("锁获取失败: {}", e)))
    }

    /// 某任务的状态日志（按写入顺序）
    pub fn status_history(&self, upload_id: &str) -> RepositoryResult<Vec<(UploadStatus, String)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, detail FROM upload_status_log WHERE upload_id = ?1 ORDER BY log_id",
        )?;
        let rows = stmt
            .query_map(params![upload_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(status, detail)| {
                let status = UploadStatus::parse(&status).ok_or_else(|| RepositoryError::FieldValueError {
                    field: "status".to_string(),
                    message: format!("未知任务状态: {}", status),
                })?;
                Ok((status, detail))
            })
            .collect()
    }
}

#[async_trait]
impl UploadCheckpointStore for SqliteUploadJobRepository {
    async fn save(&self, checkpoint: &JobCheckpoint) -> RepositoryResult<()> {
        let json = serde_json::to_string(checkpoint)?;
        let job = &checkpoint.job;
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO upload_job (upload_id, supplier_id, status, checkpoint_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(upload_id) DO UPDATE SET
                status = excluded.status,
                checkpoint_json = excluded.checkpoint_json,
                updated_at = excluded.updated_at
            "#,
            params![
                job.upload_id,
                job.supplier_id,
                job.status.as_str(),
                json,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )?;
        debug!(upload_id = %job.upload_id, status = %job.status, "检查点已保存");
        Ok(())
    }

    async fn load(&self, upload_id: &str) -> RepositoryResult<Option<JobCheckpoint>> {
        let conn = self.get_conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT checkpoint_json FROM upload_job WHERE upload_id = ?1",
                params![upload_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn list_jobs(&self) -> RepositoryResult<Vec<UploadJob>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT checkpoint_json FROM upload_job ORDER BY created_at, upload_id")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| {
                let checkpoint: JobCheckpoint = serde_json::from_str(json)?;
                Ok(checkpoint.job)
            })
            .collect()
    }

    async fn delete(&self, upload_id: &str) -> RepositoryResult<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM upload_job WHERE upload_id = ?1", params![upload_id])?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl StatusStore for SqliteUploadJobRepository {
    async fn update(&self, upload_id: &str, status: UploadStatus, detail: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO upload_status_log (upload_id, status, detail, logged_at) VALUES (?1, ?2, ?3, ?4)",
            params![upload_id, status.as_str(), detail, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

// ==========================================
// 内存实现
// ==========================================
#[derive(Default)]
pub struct InMemoryUploadJobStore {
    checkpoints: Mutex<HashMap<String, JobCheckpoint>>,
    status_log: Mutex<Vec<(String, UploadStatus, String)>>,
}

impl InMemoryUploadJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_log(&self) -> Vec<(String, UploadStatus, String)> {
        self.status_log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

fn lock_err<T>(e: std::sync::PoisonError<T>) -> RepositoryError {
    RepositoryError::LockError(format!("锁获取失败: {}", e))
}

#[async_trait]
impl UploadCheckpointStore for InMemoryUploadJobStore {
    async fn save(&self, checkpoint: &JobCheckpoint) -> RepositoryResult<()> {
        let mut checkpoints = self.checkpoints.lock().map_err(lock_err)?;
        checkpoints.insert(checkpoint.job.upload_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, upload_id: &str) -> RepositoryResult<Option<JobCheckpoint>> {
        let checkpoints = self.checkpoints.lock().map_err(lock_err)?;
        Ok(checkpoints.get(upload_id).cloned())
    }

    async fn list_jobs(&self) -> RepositoryResult<Vec<UploadJob>> {
        let checkpoints = self.checkpoints.lock().map_err(lock_err)?;
        let mut jobs: Vec<UploadJob> = checkpoints.values().map(|c| c.job.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.upload_id.cmp(&b.upload_id)));
        Ok(jobs)
    }

    async fn delete(&self, upload_id: &str) -> RepositoryResult<bool> {
        let mut checkpoints = self.checkpoints.lock().map_err(lock_err)?;
        Ok(checkpoints.remove(upload_id).is_some())
    }
}

#[async_trait]
impl StatusStore for InMemoryUploadJobStore {
    async fn update(&self, upload_id: &str, status: UploadStatus, detail: &str) -> RepositoryResult<()> {
        let mut log = self.status_log.lock().map_err(lock_err)?;
        log.push((upload_id.to_string(), status, detail.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::price_list::{FileMetadata, UploadOptions};

    fn checkpoint(id: &str) -> JobCheckpoint {
        JobCheckpoint::new(UploadJob::new(
            id.to_string(),
            "S1".to_string(),
            FileMetadata {
                file_name: "list.csv".to_string(),
                mime_type: "text/csv".to_string(),
                size_bytes: 10,
            },
            UploadOptions::default(),
            Utc::now(),
        ))
    }

    #[tokio::test]
    async fn test_sqlite_checkpoint_roundtrip() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let repo = SqliteUploadJobRepository::new(conn).unwrap();

        let mut cp = checkpoint("U1");
        repo.save(&cp).await.unwrap();
        cp.job.status = UploadStatus::ParsingFile;
        cp.committed_items = 3;
        repo.save(&cp).await.unwrap();

        let loaded = repo.load("U1").await.unwrap().unwrap();
        assert_eq!(loaded.job.status, UploadStatus::ParsingFile);
        assert_eq!(loaded.committed_items, 3);
        assert_eq!(repo.list_jobs().await.unwrap().len(), 1);

        assert!(repo.delete("U1").await.unwrap());
        assert!(!repo.delete("U1").await.unwrap());
        assert!(repo.load("U1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_status_log() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let repo = SqliteUploadJobRepository::new(conn).unwrap();
        repo.update("U1", UploadStatus::Created, "created").await.unwrap();
        repo.update("U1", UploadStatus::ParsingFile, "parsing").await.unwrap();

        let history = repo.status_history("U1").unwrap();
        assert_eq!(
            history,
            vec![
                (UploadStatus::Created, "created".to_string()),
                (UploadStatus::ParsingFile, "parsing".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryUploadJobStore::new();
        store.save(&checkpoint("U2")).await.unwrap();
        store.update("U2", UploadStatus::Created, "x").await.unwrap();
        assert!(store.load("U2").await.unwrap().is_some());
        assert_eq!(store.status_log().len(), 1);
    }
}
