// ==========================================
// 价目表导入系统 - 核心库
// ==========================================
// 职责: 供应商价目表文件 → 校验、去重、定价后的目录条目
// 技术栈: Rust + tokio + SQLite
// 流程: 解析 → 列映射 → 数据校验 → 重复检查 → 定价 → 分批导入
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 协作方接口与 SQLite 实现
pub mod repository;

// 引擎层 - 定价规则、编排、事件
pub mod engine;

// 导入层 - 解析、映射、校验、去重
pub mod importer;

// 配置层 - 导入参数
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一/表结构）
pub mod db;

// 日志系统
pub mod logging;

// API 层 - 业务接口
pub mod api;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{
    CanonicalField, DuplicateAction, DuplicateHandling, FileFormat, UploadStatus,
};

// 领域实体
pub use domain::price_list::{
    ApprovalOverrides, PriceRule, UploadJob, UploadOptions, UploadOutcome, UploadPayload,
    UploadRequest,
};

// 引擎
pub use engine::{PriceRulesEngine, UploadCollaborators, UploadOrchestrator};

// 导入
pub use importer::{ColumnMapper, ImportError, ImportResult, ParserRegistry};

// 配置
pub use config::{ConfigManager, IngestConfig};

// API
pub use api::{ApiError, UploadApi};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "价目表导入系统";
