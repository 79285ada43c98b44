// ==========================================
// 价目表导入系统 - API 层
// ==========================================
// 职责: 提供业务 API 接口，供 CLI 或宿主应用调用
// ==========================================

pub mod error;
pub mod upload_api;

// 重导出核心类型
pub use error::{ApiError, ApiResult};
pub use upload_api::UploadApi;
