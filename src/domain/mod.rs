// ==========================================
// 价目表导入系统 - 领域模型层
// ==========================================
// 职责: 定义领域实体、类型
// 红线: 不含数据访问逻辑,不含流水线逻辑
// ==========================================

pub mod price_list;
pub mod types;

// 重导出核心类型
pub use price_list::{
    Adjustment, ApprovalOverrides, CatalogItem, ColumnMapping, DuplicateRecord,
    DuplicateResolution, FieldMatch, FileMetadata, ImportSummary, JobCheckpoint, JobError,
    MappedRow, MappingSuggestion, MatchSource, ParsedRow, ParsedTable, PriceAudit, PriceListMeta,
    PriceListRecord, PriceListStatus, PriceRule, PriceRuleKind, PriceSummary, PriceTier,
    PricedItem, ResolvedItem, ReviewReason, RuleApplication, RuleScope, Supplier, UploadJob,
    UploadOptions, UploadOutcome, UploadPayload, UploadRequest, ValidatedItem, ValidationIssue,
    ValidationReport,
};
pub use types::{
    CanonicalField, DuplicateAction, DuplicateHandling, FileFormat, Severity, UploadStatus,
    ValidationMode, WriteMode,
};
