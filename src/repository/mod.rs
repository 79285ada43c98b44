// ==========================================
// 价目表导入系统 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// 职责: 提供编排器协作方的 SQLite 实现，屏蔽数据库细节
// 约束: 所有查询使用参数化
// ==========================================

pub mod error;
pub mod mapping_feedback_repo;
pub mod price_list_repo;
pub mod price_list_repo_impl;
pub mod upload_job_repo;
pub mod upload_job_repo_impl;

// 重导出核心仓储
pub use error::{RepositoryError, RepositoryResult};
pub use mapping_feedback_repo::SqliteLearningStore;
pub use price_list_repo::{ExistingItemsLookup, PriceListPersistence, SupplierDirectory};
pub use price_list_repo_impl::SqlitePriceListRepository;
pub use upload_job_repo::{StatusStore, UploadCheckpointStore};
pub use upload_job_repo_impl::{InMemoryUploadJobStore, SqliteUploadJobRepository};
