// ==========================================
// 价目表导入系统 - 编排器协作方聚合
// ==========================================
// 职责: 聚合编排器所需的全部外部协作方，简化依赖注入
// 说明: 测试时可整体替换为内存替身
// ==========================================

use std::sync::Arc;

use crate::engine::events::{NoOpNotificationDispatcher, NotificationDispatcher};
use crate::repository::price_list_repo::{ExistingItemsLookup, PriceListPersistence, SupplierDirectory};
use crate::repository::upload_job_repo::{StatusStore, UploadCheckpointStore};

/// 编排器协作方集合
///
/// # 包含的协作方
/// - `suppliers`: 供应商查询
/// - `existing_items`: 现有目录快照
/// - `persistence`: 价目表/条目写入
/// - `status_store`: 对外状态（尽力而为）
/// - `checkpoints`: 任务检查点（挂起/恢复）
/// - `notifier`: 完成通知（发后即忘）
#[derive(Clone)]
pub struct UploadCollaborators {
    pub suppliers: Arc<dyn SupplierDirectory>,
    pub existing_items: Arc<dyn ExistingItemsLookup>,
    pub persistence: Arc<dyn PriceListPersistence>,
    pub status_store: Arc<dyn StatusStore>,
    pub checkpoints: Arc<dyn UploadCheckpointStore>,
    pub notifier: Arc<dyn NotificationDispatcher>,
}

impl UploadCollaborators {
    /// 创建协作方集合（通知器默认为空操作）
    pub fn new(
        suppliers: Arc<dyn SupplierDirectory>,
        existing_items: Arc<dyn ExistingItemsLookup>,
        persistence: Arc<dyn PriceListPersistence>,
        status_store: Arc<dyn StatusStore>,
        checkpoints: Arc<dyn UploadCheckpointStore>,
    ) -> Self {
        Self {
            suppliers,
            existing_items,
            persistence,
            status_store,
            checkpoints,
            notifier: Arc::new(NoOpNotificationDispatcher),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        self.notifier = notifier;
        self
    }
}
