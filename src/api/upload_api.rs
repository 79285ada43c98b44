// ==========================================
// 价目表导入系统 - 上传 API
// ==========================================
// 职责: 以数据库路径装配 SQLite 协作方 + 编排器，对外暴露上传操作
// 返回: 可序列化的 UploadOutcome / UploadJob
// ==========================================

use crate::api::error::{ApiError, ApiResult};
use crate::config::{ConfigManager, IngestConfigReader};
use crate::db::open_sqlite_connection;
use crate::domain::price_list::{
    ApprovalOverrides, PriceListRecord, Supplier, UploadJob, UploadOptions, UploadOutcome,
    UploadRequest,
};
use crate::domain::types::{CanonicalField, UploadStatus};
use crate::engine::{EventBus, NotificationDispatcher, UploadCollaborators, UploadOrchestrator};
use crate::importer::price_list_importer_trait::LearnedWeight;
use crate::repository::{SqliteLearningStore, SqlitePriceListRepository, SqliteUploadJobRepository};
use chrono::Utc;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// 未声明 MIME 时按扩展名识别
const GENERIC_MIME: &str = "application/octet-stream";

/// 上传API
pub struct UploadApi {
    orchestrator: UploadOrchestrator,
    price_lists: Arc<SqlitePriceListRepository>,
    jobs: Arc<SqliteUploadJobRepository>,
    config_manager: ConfigManager,
}

impl UploadApi {
    /// 创建新的 UploadApi 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径（不存在则创建并初始化表结构）
    pub async fn new(db_path: &str) -> ApiResult<Self> {
        let conn = open_sqlite_connection(db_path)
            .map_err(|e| ApiError::DatabaseConnectionError(format!("{}: {}", db_path, e)))?;
        Self::from_connection(Arc::new(Mutex::new(conn)), None).await
    }

    /// 从已有连接装配（可选注入通知器）
    pub async fn from_connection(
        conn: Arc<Mutex<Connection>>,
        notifier: Option<Arc<dyn NotificationDispatcher>>,
    ) -> ApiResult<Self> {
        let config_manager = ConfigManager::from_connection(conn.clone())
            .map_err(|e| ApiError::DatabaseConnectionError(e.to_string()))?;
        let price_lists = Arc::new(SqlitePriceListRepository::new(conn.clone())?);
        let jobs = Arc::new(SqliteUploadJobRepository::new(conn.clone())?);
        let learning_store = Arc::new(SqliteLearningStore::new(conn)?);

        let mut collaborators = UploadCollaborators::new(
            price_lists.clone(),
            price_lists.clone(),
            price_lists.clone(),
            jobs.clone(),
            jobs.clone(),
        );
        if let Some(notifier) = notifier {
            collaborators = collaborators.with_notifier(notifier);
        }

        let orchestrator =
            UploadOrchestrator::from_reader(collaborators, &config_manager, learning_store).await?;
        info!("UploadApi 初始化完成");

        Ok(Self {
            orchestrator,
            price_lists,
            jobs,
            config_manager,
        })
    }

    /// 事件总线（注册监听器用）
    pub fn events(&self) -> Arc<EventBus> {
        self.orchestrator.events()
    }

    // ==========================================
    // 上传
    // ==========================================

    /// 上传内存中的文件
    pub async fn upload(&self, request: UploadRequest) -> ApiResult<UploadOutcome> {
        Ok(self.orchestrator.start_upload(request).await?)
    }

    /// 从文件路径上传
    ///
    /// # 参数
    /// - file_path: 文件路径
    /// - supplier_id: 供应商
    /// - mime_type: 声明的 MIME 类型（None 时按扩展名识别）
    /// - options: 上传选项
    pub async fn upload_file(
        &self,
        file_path: &Path,
        supplier_id: &str,
        mime_type: Option<&str>,
        options: UploadOptions,
    ) -> ApiResult<UploadOutcome> {
        let bytes = tokio::fs::read(file_path)
            .await
            .map_err(|e| ApiError::FileReadError(format!("{}: {}", file_path.display(), e)))?;
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ApiError::InvalidInput(format!("无效的文件路径: {}", file_path.display())))?;

        let request = UploadRequest::new(
            bytes,
            file_name,
            mime_type.unwrap_or(GENERIC_MIME),
            supplier_id,
        )
        .with_options(options);
        self.upload(request).await
    }

    /// 并发上传多个文件
    pub async fn upload_many(&self, requests: Vec<UploadRequest>) -> Vec<ApiResult<UploadOutcome>> {
        self.orchestrator
            .start_uploads(requests)
            .await
            .into_iter()
            .map(|r| r.map_err(ApiError::from))
            .collect()
    }

    // ==========================================
    // 任务操作
    // ==========================================

    pub async fn approve(&self, upload_id: &str, overrides: ApprovalOverrides) -> ApiResult<UploadOutcome> {
        Ok(self.orchestrator.approve(upload_id, overrides).await?)
    }

    pub async fn cancel(&self, upload_id: &str, reason: Option<String>) -> ApiResult<UploadOutcome> {
        Ok(self.orchestrator.cancel(upload_id, reason).await?)
    }

    pub async fn get_job(&self, upload_id: &str) -> ApiResult<UploadJob> {
        Ok(self.orchestrator.get_job(upload_id).await?)
    }

    pub async fn list_jobs(&self) -> ApiResult<Vec<UploadJob>> {
        Ok(self.orchestrator.list_jobs().await?)
    }

    /// 任务状态日志
    pub fn status_history(&self, upload_id: &str) -> ApiResult<Vec<(UploadStatus, String)>> {
        Ok(self.jobs.status_history(upload_id)?)
    }

    /// 清理过期终态任务
    pub async fn archive_expired_jobs(&self) -> ApiResult<usize> {
        Ok(self.orchestrator.archive_expired_jobs(Utc::now()).await?)
    }

    // ==========================================
    // 映射学习 / 主数据 / 配置
    // ==========================================

    pub fn learn_from_feedback(
        &self,
        header: &str,
        field: CanonicalField,
        is_correct: bool,
    ) -> ApiResult<LearnedWeight> {
        Ok(self.orchestrator.learn_from_feedback(header, field, is_correct)?)
    }

    pub fn register_supplier(&self, supplier: &Supplier) -> ApiResult<()> {
        if supplier.supplier_id.trim().is_empty() {
            return Err(ApiError::InvalidInput("supplier_id 不能为空".to_string()));
        }
        Ok(self.price_lists.upsert_supplier(supplier)?)
    }

    pub fn get_price_list(&self, price_list_id: &str) -> ApiResult<PriceListRecord> {
        self.price_lists
            .find_price_list(price_list_id)?
            .ok_or_else(|| ApiError::NotFound(format!("价目表(id={})不存在", price_list_id)))
    }

    pub fn count_price_list_items(&self, price_list_id: &str) -> ApiResult<usize> {
        Ok(self.price_lists.count_items(price_list_id)?)
    }

    /// 写入配置（下次创建 UploadApi 时生效）
    pub async fn set_config_value(&self, key: &str, value: &str) -> ApiResult<()> {
        self.config_manager.set_config_value(key, value)?;
        // 写入后立即校验可加载性
        self.config_manager.load_ingest_config().await?;
        Ok(())
    }
}
