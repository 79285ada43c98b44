// ==========================================
// 价目表导入系统 - 上传任务 Repository Trait
// ==========================================
// 职责: 任务检查点（挂起/恢复）与状态日志接口
// 约束: 挂起点的全部中间产物必须可持久化，进程重启不丢审批
// ==========================================

use crate::domain::price_list::{JobCheckpoint, UploadJob};
use crate::domain::types::UploadStatus;
use crate::repository::error::RepositoryResult;
use async_trait::async_trait;

// ==========================================
// UploadCheckpointStore Trait
// ==========================================
#[async_trait]
pub trait UploadCheckpointStore: Send + Sync {
    /// 保存（覆盖）检查点
    async fn save(&self, checkpoint: &JobCheckpoint) -> RepositoryResult<()>;

    async fn load(&self, upload_id: &str) -> RepositoryResult<Option<JobCheckpoint>>;

    /// 全部任务（不含中间产物）
    async fn list_jobs(&self) -> RepositoryResult<Vec<UploadJob>>;

    /// 删除检查点；返回是否存在
    async fn delete(&self, upload_id: &str) -> RepositoryResult<bool>;
}

// ==========================================
// StatusStore Trait
// ==========================================
// 用途: 对外状态展示（尽力而为，失败不影响任务）
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn update(&self, upload_id: &str, status: UploadStatus, detail: &str) -> RepositoryResult<()>;
}
