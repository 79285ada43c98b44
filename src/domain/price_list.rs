// ==========================================
// 价目表导入系统 - 价目表领域模型
// ==========================================
// 职责: 上传任务、解析结果、映射、校验、去重、定价等实体
// 红线: 不含 IO，不含流水线逻辑
// ==========================================

use crate::domain::types::{
    CanonicalField, DuplicateAction, DuplicateHandling, FileFormat, Severity, UploadStatus,
    WriteMode,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ==========================================
// 上传请求与选项
// ==========================================

/// 文件元信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_name: String,  // 原始文件名
    pub mime_type: String,  // 声明的 MIME 类型
    pub size_bytes: u64,    // 文件字节数
}

/// 单次上传的选项包
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadOptions {
    pub intelligent_parsing: bool,            // 启用样本值启发式映射
    pub strict_validation: bool,              // strict / lenient
    pub duplicate_handling: DuplicateHandling, // skip / overwrite / warn / merge
    pub price_rules_config: Vec<PriceRule>,   // 有序定价规则
    pub require_preview: bool,                // 导入前预览
    pub require_approval: bool,               // 导入前审批
    pub auto_activate: bool,                  // 价目表直接生效
    pub notify_supplier: bool,                // 完成后通知供应商
    pub batch_size: usize,                    // 每批写入条数
    pub max_errors: usize,                    // 致命错误上限
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            intelligent_parsing: true,
            strict_validation: false,
            duplicate_handling: DuplicateHandling::Skip,
            price_rules_config: Vec::new(),
            require_preview: false,
            require_approval: false,
            auto_activate: true,
            notify_supplier: false,
            batch_size: 100,
            max_errors: 100,
        }
    }
}

impl UploadOptions {
    /// 选项合法性检查
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batchSize 必须大于 0".to_string());
        }
        if self.max_errors == 0 {
            return Err("maxErrors 必须大于 0".to_string());
        }
        Ok(())
    }

    pub fn needs_checkpoint_before_import(&self) -> bool {
        self.require_preview || self.require_approval
    }
}

/// 上传请求（库调用入口）
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
    pub supplier_id: String,
    pub options: UploadOptions,
}

impl UploadRequest {
    pub fn new(
        file_bytes: Vec<u8>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        supplier_id: impl Into<String>,
    ) -> Self {
        Self {
            file_bytes,
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            supplier_id: supplier_id.into(),
            options: UploadOptions::default(),
        }
    }

    pub fn with_options(mut self, options: UploadOptions) -> Self {
        self.options = options;
        self
    }
}

// ==========================================
// UploadJob - 上传任务
// ==========================================
// 用途: 由编排器独占持有，仅通过状态转换修改

/// 任务错误/警告记录（保留行号与字段，便于人工定点修正）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub code: String,
    pub message: String,
    pub row_number: Option<usize>,
    pub field: Option<String>,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            row_number: None,
            field: None,
        }
    }

    pub fn from_issue(code: &str, issue: &ValidationIssue) -> Self {
        Self {
            code: code.to_string(),
            message: issue.message.clone(),
            row_number: issue.row_number,
            field: issue.field.map(|f| f.as_str().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadJob {
    pub upload_id: String,
    pub supplier_id: String,
    pub file: FileMetadata,
    pub status: UploadStatus,
    pub status_message: String,
    pub options: UploadOptions,
    pub errors: Vec<JobError>,
    pub warnings: Vec<JobError>,
    pub progress: u8, // 0-100
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadJob {
    pub fn new(
        upload_id: String,
        supplier_id: String,
        file: FileMetadata,
        options: UploadOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            upload_id,
            supplier_id,
            file,
            status: UploadStatus::Created,
            status_message: "任务已创建".to_string(),
            options,
            errors: Vec::new(),
            warnings: Vec::new(),
            progress: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

// ==========================================
// 解析结果
// ==========================================

/// 单行原始数据（与表头按位置对齐）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedRow {
    pub row_number: usize, // 1-based，数据行序号
    pub values: Vec<String>,
}

impl ParsedRow {
    pub fn value(&self, index: usize) -> Option<&str> {
        self.values.get(index).map(|s| s.as_str())
    }
}

/// 解析器输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTable {
    pub format: FileFormat,
    pub headers: Vec<String>,
    pub rows: Vec<ParsedRow>,
    pub heuristic: bool, // 非结构化启发式提取
}

impl ParsedTable {
    /// 行的 表头 → 原始值 视图
    pub fn row_map<'a>(&'a self, row: &'a ParsedRow) -> BTreeMap<&'a str, &'a str> {
        self.headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.as_str(), row.value(i).unwrap_or("")))
            .collect()
    }

    /// 某列前 n 个非空样本值
    pub fn column_samples(&self, index: usize, limit: usize) -> Vec<&str> {
        self.rows
            .iter()
            .filter_map(|r| r.value(index))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .take(limit)
            .collect()
    }
}

// ==========================================
// 列映射
// ==========================================

/// 映射来源（同分时的优先级即声明顺序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Manual,
    Exact,
    Annotated,
    Learned,
    Fuzzy,
    Pattern,
    SampleValues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMatch {
    pub header_index: usize,
    pub header: String,
    pub confidence: f64, // 0-1
    pub source: MatchSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSuggestion {
    pub header_index: usize,
    pub header: String,
    pub score: f64,
}

/// 标准字段 → 源表头
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub headers: Vec<String>,
    pub fields: BTreeMap<CanonicalField, FieldMatch>,
    pub unmapped_headers: Vec<String>,
    pub suggestions: BTreeMap<CanonicalField, Vec<MappingSuggestion>>,
    pub inferred_currency: Option<String>, // 来自 "Price (USD)" 之类的表头注解
}

impl ColumnMapping {
    pub fn header_index(&self, field: CanonicalField) -> Option<usize> {
        self.fields.get(&field).map(|m| m.header_index)
    }

    pub fn confidence(&self, field: CanonicalField) -> f64 {
        self.fields.get(&field).map(|m| m.confidence).unwrap_or(0.0)
    }

    pub fn missing_required(&self) -> Vec<CanonicalField> {
        CanonicalField::ALL
            .iter()
            .copied()
            .filter(|f| f.is_required() && !self.fields.contains_key(f))
            .collect()
    }

    pub fn mean_confidence(&self) -> f64 {
        if self.fields.is_empty() {
            return 0.0;
        }
        let total: f64 = self.fields.values().map(|m| m.confidence).sum();
        total / self.fields.len() as f64
    }

    /// 必填字段缺失或平均置信度不足时需要人工复核
    pub fn requires_review(&self, min_confidence: f64) -> bool {
        !self.missing_required().is_empty() || self.mean_confidence() < min_confidence
    }

    /// 人工重映射: 表头按名称匹配（忽略大小写与首尾空白）
    ///
    /// 同一表头若已分配给其它字段，会先从该字段移除
    pub fn apply_override(&mut self, field: CanonicalField, header: &str) -> Result<(), String> {
        let wanted = header.trim().to_lowercase();
        let index = self
            .headers
            .iter()
            .position(|h| h.trim().to_lowercase() == wanted)
            .ok_or_else(|| format!("表头不存在: {}", header))?;

        self.fields.retain(|_, m| m.header_index != index);
        self.fields.insert(
            field,
            FieldMatch {
                header_index: index,
                header: self.headers[index].clone(),
                confidence: 1.0,
                source: MatchSource::Manual,
            },
        );
        self.suggestions.remove(&field);
        self.refresh_unmapped();
        Ok(())
    }

    pub fn refresh_unmapped(&mut self) {
        let assigned: Vec<usize> = self.fields.values().map(|m| m.header_index).collect();
        self.unmapped_headers = self
            .headers
            .iter()
            .enumerate()
            .filter(|(i, _)| !assigned.contains(i))
            .map(|(_, h)| h.clone())
            .collect();
    }
}

/// 按映射拆分后的行: 标准字段 + 扩展字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedRow {
    pub row_number: usize,
    pub values: BTreeMap<CanonicalField, String>,
    pub extra: BTreeMap<String, String>, // 未映射表头 → 原始值
}

impl MappedRow {
    pub fn get(&self, field: CanonicalField) -> Option<&str> {
        self.values
            .get(&field)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

// ==========================================
// 校验结果
// ==========================================

/// 规范化后的条目（unitPrice 恒为正，且带币种）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedItem {
    pub sku: String,
    pub description: String, // 允许为空
    pub unit_price: Decimal,
    pub currency: String,    // ISO 4217
    pub minimum_order_quantity: Option<u32>,
    pub unit_of_measure: Option<String>,
    pub category: Option<String>,
    pub row_number: usize,
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub row_number: Option<usize>,
    pub field: Option<CanonicalField>,
    pub severity: Severity,
    pub message: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid_items: Vec<ValidatedItem>,
    pub warnings: Vec<ValidationIssue>,
    pub critical_errors: Vec<ValidationIssue>,
    pub rows_scanned: usize,
    pub truncated: bool, // 达到 maxErrors 后停止扫描
}

// ==========================================
// 去重
// ==========================================

/// 供应商已生效的目录项（快照）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub item_id: String,
    pub supplier_id: String,
    pub sku: String,
    pub description: String,
    pub unit_price: Decimal,
    pub currency: String,
    pub minimum_order_quantity: Option<u32>,
    pub unit_of_measure: Option<String>,
    pub category: Option<String>,
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateRecord {
    pub sku: String,
    pub existing_item: CatalogItem,
    pub new_item: ValidatedItem,
    pub resolution_action: DuplicateAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedItem {
    pub item: ValidatedItem,
    pub write_mode: WriteMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum DuplicateResolution {
    /// skip / overwrite / merge: 得到最终条目
    Resolved {
        items: Vec<ResolvedItem>,
        duplicates: Vec<DuplicateRecord>,
    },
    /// warn: 等待外部决定
    #[serde(rename_all = "camelCase")]
    RequiresDecision {
        duplicates: Vec<DuplicateRecord>,
        new_items: Vec<ResolvedItem>,
        options: Vec<DuplicateAction>,
    },
}

impl DuplicateResolution {
    pub fn duplicates(&self) -> &[DuplicateRecord] {
        match self {
            DuplicateResolution::Resolved { duplicates, .. } => duplicates,
            DuplicateResolution::RequiresDecision { duplicates, .. } => duplicates,
        }
    }

    pub fn requires_decision(&self) -> bool {
        matches!(self, DuplicateResolution::RequiresDecision { .. })
    }
}

// ==========================================
// 定价规则
// ==========================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Adjustment {
    Percentage(Decimal), // 百分比，10 表示 10%
    Fixed(Decimal),      // 固定金额（需声明币种）
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTier {
    pub min_quantity: u32,
    pub adjustment: Adjustment, // 折扣
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum RuleScope {
    All,
    Category(String),
    Skus(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PriceRuleKind {
    Markup { adjustment: Adjustment },
    Discount { adjustment: Adjustment },
    TierPricing { tiers: Vec<PriceTier> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRule {
    pub name: String,
    pub order: i32,
    pub scope: RuleScope,
    #[serde(default)]
    pub currency: Option<String>,
    pub kind: PriceRuleKind,
}

impl PriceRule {
    pub fn markup_percent(name: impl Into<String>, order: i32, percent: Decimal) -> Self {
        Self {
            name: name.into(),
            order,
            scope: RuleScope::All,
            currency: None,
            kind: PriceRuleKind::Markup {
                adjustment: Adjustment::Percentage(percent),
            },
        }
    }

    pub fn discount_percent(name: impl Into<String>, order: i32, percent: Decimal) -> Self {
        Self {
            name: name.into(),
            order,
            scope: RuleScope::All,
            currency: None,
            kind: PriceRuleKind::Discount {
                adjustment: Adjustment::Percentage(percent),
            },
        }
    }

    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }
}

/// 单条规则的审计记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceAudit {
    pub rule_name: String,
    pub order: i32,
    pub price_before: Decimal,
    pub price_after: Decimal,
    pub manual_override: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricedItem {
    pub item: ValidatedItem,
    pub write_mode: WriteMode,
    pub final_unit_price: Decimal,
    pub applied_rules: Vec<PriceAudit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleApplication {
    pub rule_name: String,
    pub affected_items: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSummary {
    pub items_priced: usize,
    pub rules: Vec<RuleApplication>,
    pub total_before: Decimal,
    pub total_after: Decimal,
}

// ==========================================
// 审批与输出
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    MappingIncomplete, // 必填字段未映射或置信度不足
    DuplicatesPending, // warn 策略下的重复待决
}

/// 审批时的人工覆写
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApprovalOverrides {
    pub column_mappings: BTreeMap<CanonicalField, String>, // 字段 → 表头
    pub duplicate_resolutions: BTreeMap<String, DuplicateAction>, // SKU → 动作
    pub price_overrides: BTreeMap<String, Decimal>, // SKU → 最终单价
}

impl ApprovalOverrides {
    pub fn is_empty(&self) -> bool {
        self.column_mappings.is_empty()
            && self.duplicate_resolutions.is_empty()
            && self.price_overrides.is_empty()
    }
}

/// 导入汇总
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub rows_parsed: usize,
    pub valid_items: usize,
    pub warning_count: usize,
    pub critical_error_count: usize,
    pub duplicates_found: usize,
    pub items_skipped: usize,
    pub items_to_insert: usize,
    pub items_to_replace: usize,
    pub pricing: PriceSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UploadPayload {
    #[serde(rename_all = "camelCase")]
    Completed {
        price_list_id: String,
        items_processed: usize,
        summary: ImportSummary,
    },
    #[serde(rename_all = "camelCase")]
    NeedsReview {
        reason: ReviewReason,
        mapping: Option<ColumnMapping>,
        duplicates: Vec<DuplicateRecord>,
        resolution_options: Vec<DuplicateAction>,
    },
    WaitingForApproval {
        preview: Vec<PricedItem>,
        summary: ImportSummary,
    },
    Failed {
        errors: Vec<JobError>,
        warnings: Vec<JobError>,
    },
    Cancelled {
        reason: String,
    },
}

/// 每次调用的统一返回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub success: bool,
    pub upload_id: String,
    pub status: UploadStatus,
    pub payload: UploadPayload,
}

// ==========================================
// 检查点（挂起/恢复）
// ==========================================

/// 任务中间产物的持久化快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCheckpoint {
    pub job: UploadJob,
    pub table: Option<ParsedTable>,
    pub mapping: Option<ColumnMapping>,
    pub validation: Option<ValidationReport>,
    pub duplicates: Option<DuplicateResolution>,
    pub resolved: Option<Vec<ResolvedItem>>,
    pub priced: Option<Vec<PricedItem>>,
    pub price_summary: Option<PriceSummary>,
    pub review_reason: Option<ReviewReason>,
    pub price_list_id: Option<String>,
    pub committed_items: usize,
}

impl JobCheckpoint {
    pub fn new(job: UploadJob) -> Self {
        Self {
            job,
            table: None,
            mapping: None,
            validation: None,
            duplicates: None,
            resolved: None,
            priced: None,
            price_summary: None,
            review_reason: None,
            price_list_id: None,
            committed_items: 0,
        }
    }

    /// 丢弃全部中间产物（取消时）
    pub fn discard_artifacts(&mut self) {
        self.table = None;
        self.mapping = None;
        self.validation = None;
        self.duplicates = None;
        self.resolved = None;
        self.priced = None;
        self.price_summary = None;
        self.review_reason = None;
    }

    pub fn summary(&self) -> ImportSummary {
        let mut summary = ImportSummary {
            rows_parsed: self.table.as_ref().map(|t| t.rows.len()).unwrap_or(0),
            pricing: self.price_summary.clone().unwrap_or_default(),
            ..ImportSummary::default()
        };
        if let Some(report) = &self.validation {
            summary.valid_items = report.valid_items.len();
            summary.warning_count = report.warnings.len();
            summary.critical_error_count = report.critical_errors.len();
        }
        if let Some(resolution) = &self.duplicates {
            summary.duplicates_found = resolution.duplicates().len();
        }
        if let Some(resolved) = &self.resolved {
            summary.items_to_insert = resolved
                .iter()
                .filter(|r| r.write_mode == WriteMode::Insert)
                .count();
            summary.items_to_replace = resolved.len() - summary.items_to_insert;
            summary.items_skipped = summary.valid_items.saturating_sub(resolved.len());
        }
        summary
    }
}

// ==========================================
// 外部协作方实体
// ==========================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Supplier {
    pub supplier_id: String,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceListStatus {
    Active,
    Draft,
}

impl PriceListStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceListStatus::Active => "active",
            PriceListStatus::Draft => "draft",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceListMeta {
    pub supplier_id: String,
    pub upload_id: String,
    pub name: String,
    pub status: PriceListStatus,
    pub currency: Option<String>, // 条目币种一致时填写
    pub item_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceListRecord {
    pub price_list_id: String,
    pub meta: PriceListMeta,
    pub created_at: DateTime<Utc>,
}
