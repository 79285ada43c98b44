// ==========================================
// 价目表导入系统 - 流水线错误类型
// ==========================================
// 工具: thiserror 派生宏
// 分类: code() 返回对外错误分类名
// ==========================================

use crate::domain::price_list::JobError;
use crate::repository::error::RepositoryError;
use thiserror::Error;

/// 流水线错误类型
#[derive(Error, Debug)]
pub enum ImportError {
    // ===== 文件相关错误 =====
    #[error("文件格式不支持: {0}")]
    UnsupportedFormat(String),

    #[error("文件解析失败: {0}")]
    ParseError(String),

    #[error("文件过大: {size} 字节，上限 {limit} 字节")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("数据行数超过上限 {limit}")]
    RowLimitExceeded { limit: usize },

    #[error("提取超时: {0} ms")]
    Timeout(u64),

    // ===== 映射/校验错误 =====
    #[error("必填字段未映射: {}", .missing.join(", "))]
    MappingUnresolved { missing: Vec<String> },

    #[error("数据校验失败: {0}")]
    ValidationFailed(String),

    #[error("重复冲突 (sku={sku}): {message}")]
    DuplicateConflict { sku: String, message: String },

    // ===== 定价错误 =====
    #[error("币种不匹配 (rule={rule}): 规则币种 {rule_currency}，条目币种 {item_currency}")]
    CurrencyMismatch {
        rule: String,
        rule_currency: String,
        item_currency: String,
    },

    #[error("定价规则无效 (rule={rule}): {message}")]
    InvalidPriceRule { rule: String, message: String },

    #[error("定价结果非正 (sku={sku}, rule={rule})")]
    NonPositivePrice { sku: String, rule: String },

    #[error("价格计算溢出 (sku={sku}, rule={rule})")]
    PriceOverflow { sku: String, rule: String },

    // ===== 持久化错误 =====
    #[error("持久化失败（已提交 {committed} 条）: {message}")]
    PersistenceError { message: String, committed: usize },

    // ===== 任务错误 =====
    #[error("供应商不存在: {0}")]
    SupplierNotFound(String),

    #[error("上传任务不存在: {0}")]
    JobNotFound(String),

    #[error("无效的状态转换: from={from} to={to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("选项无效: {0}")]
    InvalidOptions(String),

    // ===== 通用错误 =====
    #[error("系统错误: {0}")]
    SystemError(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ImportError {
    /// 对外错误分类名
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::UnsupportedFormat(_) => "UnsupportedFormatError",
            ImportError::ParseError(_)
            | ImportError::FileTooLarge { .. }
            | ImportError::RowLimitExceeded { .. } => "ParseError",
            ImportError::Timeout(_) => "TimeoutError",
            ImportError::MappingUnresolved { .. } => "MappingUnresolved",
            ImportError::ValidationFailed(_) | ImportError::InvalidOptions(_) => "ValidationError",
            ImportError::DuplicateConflict { .. } => "DuplicateConflict",
            ImportError::CurrencyMismatch { .. }
            | ImportError::InvalidPriceRule { .. }
            | ImportError::NonPositivePrice { .. }
            | ImportError::PriceOverflow { .. } => "PricingError",
            ImportError::PersistenceError { .. } => "PersistenceError",
            ImportError::SupplierNotFound(_) => "SupplierNotFound",
            ImportError::JobNotFound(_) => "JobNotFound",
            ImportError::InvalidStateTransition { .. } => "InvalidStateTransition",
            ImportError::Repository(RepositoryError::DuplicateConflict { .. }) => {
                "DuplicateConflict"
            }
            ImportError::Repository(_) => "PersistenceError",
            ImportError::SystemError(_) | ImportError::Other(_) => "SystemError",
        }
    }

    /// 是否为写入时唯一性冲突（含仓储层上抛）
    pub fn is_duplicate_conflict(&self) -> bool {
        self.code() == "DuplicateConflict"
    }

    pub fn to_job_error(&self) -> JobError {
        let mut job_error = JobError::new(self.code(), self.to_string());
        if let ImportError::DuplicateConflict { sku, .. } = self {
            job_error.field = Some("sku".to_string());
            job_error.message = format!("{} ({})", job_error.message, sku);
        }
        job_error
    }
}

// 实现 From<std::io::Error>
impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        ImportError::ParseError(format!("读取失败: {}", err))
    }
}

// 实现 From<csv::Error>
impl From<csv::Error> for ImportError {
    fn from(err: csv::Error) -> Self {
        ImportError::ParseError(format!("CSV 解析失败: {}", err))
    }
}

// 实现 From<calamine::Error>
impl From<calamine::Error> for ImportError {
    fn from(err: calamine::Error) -> Self {
        ImportError::ParseError(format!("Excel 解析失败: {}", err))
    }
}

// 实现 From<serde_json::Error>
impl From<serde_json::Error> for ImportError {
    fn from(err: serde_json::Error) -> Self {
        ImportError::ParseError(format!("JSON 解析失败: {}", err))
    }
}

// 实现 From<quick_xml::Error>
impl From<quick_xml::Error> for ImportError {
    fn from(err: quick_xml::Error) -> Self {
        ImportError::ParseError(format!("XML 解析失败: {}", err))
    }
}

// 实现 From<zip::result::ZipError>
impl From<zip::result::ZipError> for ImportError {
    fn from(err: zip::result::ZipError) -> Self {
        ImportError::ParseError(format!("DOCX 容器读取失败: {}", err))
    }
}

// 实现 From<lopdf::Error>
impl From<lopdf::Error> for ImportError {
    fn from(err: lopdf::Error) -> Self {
        ImportError::ParseError(format!("PDF 解析失败: {}", err))
    }
}

/// Result 类型别名
pub type ImportResult<T> = Result<T, ImportError>;
