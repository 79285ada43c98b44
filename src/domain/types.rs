// ==========================================
// 价目表导入系统 - 领域类型定义
// ==========================================
// 职责: 状态机状态、文件格式、标准字段等枚举
// 序列化格式: 与上游调用方/数据库保持一致
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 文件格式 (File Format)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,   // 逗号/分号/制表符分隔
    Excel, // .xlsx / .xls
    Json,
    Xml,
    Pdf,   // 非结构化: 文本表格启发式
    Word,  // 非结构化: .docx 表格或段落
    Email, // 非结构化: 附件或正文
}

impl FileFormat {
    /// 结构化格式可确定性解析；非结构化格式依赖启发式提取
    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            FileFormat::Csv | FileFormat::Excel | FileFormat::Json | FileFormat::Xml
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Excel => "excel",
            FileFormat::Json => "json",
            FileFormat::Xml => "xml",
            FileFormat::Pdf => "pdf",
            FileFormat::Word => "word",
            FileFormat::Email => "email",
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 上传任务状态 (Upload Status)
// ==========================================
// 主线: created → validating_supplier → parsing_file → mapping_columns
//       → validating_data → checking_duplicates → applying_price_rules
//       → {waiting_for_approval | importing_items} → completed
// 支线: needs_review（挂起）, failed / cancelled（终态）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Created,
    ValidatingSupplier,
    ParsingFile,
    MappingColumns,
    ValidatingData,
    CheckingDuplicates,
    ApplyingPriceRules,
    NeedsReview,
    WaitingForApproval,
    ImportingItems,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Created => "created",
            UploadStatus::ValidatingSupplier => "validating_supplier",
            UploadStatus::ParsingFile => "parsing_file",
            UploadStatus::MappingColumns => "mapping_columns",
            UploadStatus::ValidatingData => "validating_data",
            UploadStatus::CheckingDuplicates => "checking_duplicates",
            UploadStatus::ApplyingPriceRules => "applying_price_rules",
            UploadStatus::NeedsReview => "needs_review",
            UploadStatus::WaitingForApproval => "waiting_for_approval",
            UploadStatus::ImportingItems => "importing_items",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<UploadStatus> {
        let status = match s.trim().to_lowercase().as_str() {
            "created" => UploadStatus::Created,
            "validating_supplier" => UploadStatus::ValidatingSupplier,
            "parsing_file" => UploadStatus::ParsingFile,
            "mapping_columns" => UploadStatus::MappingColumns,
            "validating_data" => UploadStatus::ValidatingData,
            "checking_duplicates" => UploadStatus::CheckingDuplicates,
            "applying_price_rules" => UploadStatus::ApplyingPriceRules,
            "needs_review" => UploadStatus::NeedsReview,
            "waiting_for_approval" => UploadStatus::WaitingForApproval,
            "importing_items" => UploadStatus::ImportingItems,
            "completed" => UploadStatus::Completed,
            "failed" => UploadStatus::Failed,
            "cancelled" => UploadStatus::Cancelled,
            _ => return None,
        };
        Some(status)
    }

    /// 终态: 不再接受任何转换
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }

    /// 挂起点: 等待外部 approve / cancel
    pub fn is_suspended(&self) -> bool {
        matches!(
            self,
            UploadStatus::NeedsReview | UploadStatus::WaitingForApproval
        )
    }

    /// 进度里程碑（0-100）
    pub fn progress_milestone(&self) -> u8 {
        match self {
            UploadStatus::Created => 0,
            UploadStatus::ValidatingSupplier => 5,
            UploadStatus::ParsingFile => 15,
            UploadStatus::MappingColumns => 30,
            UploadStatus::ValidatingData => 45,
            UploadStatus::CheckingDuplicates => 60,
            UploadStatus::ApplyingPriceRules => 70,
            UploadStatus::NeedsReview | UploadStatus::WaitingForApproval => 75,
            UploadStatus::ImportingItems => 80,
            UploadStatus::Completed => 100,
            // 失败/取消保留原进度
            UploadStatus::Failed | UploadStatus::Cancelled => 0,
        }
    }

    /// 状态转换合法性
    ///
    /// # 规则
    /// - 终态不可再转换
    /// - 任一非终态可转为 failed / cancelled
    /// - 挂起点恢复时允许回到受影响的下游阶段
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }

        match (self, next) {
            (Created, ValidatingSupplier) => true,
            (ValidatingSupplier, ParsingFile) => true,
            (ParsingFile, MappingColumns) => true,
            (MappingColumns, ValidatingData) => true,
            (MappingColumns, NeedsReview) => true,
            (ValidatingData, CheckingDuplicates) => true,
            (CheckingDuplicates, ApplyingPriceRules) => true,
            (CheckingDuplicates, NeedsReview) => true,
            (ApplyingPriceRules, WaitingForApproval) => true,
            (ApplyingPriceRules, ImportingItems) => true,
            (ImportingItems, Completed) => true,
            // 人工复核后重跑受影响阶段
            (NeedsReview, ValidatingData) => true,
            (NeedsReview, CheckingDuplicates) => true,
            (NeedsReview, ApplyingPriceRules) => true,
            // 审批时可携带覆写重跑下游阶段
            (WaitingForApproval, ValidatingData) => true,
            (WaitingForApproval, CheckingDuplicates) => true,
            (WaitingForApproval, ApplyingPriceRules) => true,
            (WaitingForApproval, ImportingItems) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 校验模式 (Validation Mode)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Strict,  // 严格: 任何违规即拒绝该行
    Lenient, // 宽松: 可修正的违规降级为警告
}

impl ValidationMode {
    pub fn from_strict_flag(strict: bool) -> Self {
        if strict {
            ValidationMode::Strict
        } else {
            ValidationMode::Lenient
        }
    }
}

// ==========================================
// 重复处理策略 (Duplicate Handling)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateHandling {
    #[default]
    Skip,      // 丢弃重复，仅导入新 SKU
    Overwrite, // 新记录覆盖旧记录
    Warn,      // 返回重复列表，等待人工决定
    Merge,     // 字段级合并
}

impl fmt::Display for DuplicateHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicateHandling::Skip => write!(f, "skip"),
            DuplicateHandling::Overwrite => write!(f, "overwrite"),
            DuplicateHandling::Warn => write!(f, "warn"),
            DuplicateHandling::Merge => write!(f, "merge"),
        }
    }
}

// ==========================================
// 重复记录处理动作
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateAction {
    Skip,
    Overwrite,
    Merge,
    Pending, // 等待人工决定（warn 策略）
}

impl DuplicateAction {
    /// warn 策略下提供给人工的可选动作
    pub fn resolution_options() -> Vec<DuplicateAction> {
        vec![
            DuplicateAction::Skip,
            DuplicateAction::Overwrite,
            DuplicateAction::Merge,
        ]
    }
}

// ==========================================
// 落库方式
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum WriteMode {
    /// 新 SKU: 写入时需再次校验唯一性
    Insert,
    /// 替换已有目录项
    #[serde(rename_all = "camelCase")]
    Replace { existing_item_id: String },
}

// ==========================================
// 校验问题级别
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,  // 不阻断流水线
    Critical, // 该行被拒绝
}

// ==========================================
// 标准字段 (Canonical Field)
// ==========================================
// 所有输入格式最终都映射到这组固定字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CanonicalField {
    Sku,
    Description,
    UnitPrice,
    Currency,
    MinimumOrderQuantity,
    UnitOfMeasure,
    Category,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 7] = [
        CanonicalField::Sku,
        CanonicalField::Description,
        CanonicalField::UnitPrice,
        CanonicalField::Currency,
        CanonicalField::MinimumOrderQuantity,
        CanonicalField::UnitOfMeasure,
        CanonicalField::Category,
    ];

    /// 标准字段名（camelCase，与输出契约一致）
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::Sku => "sku",
            CanonicalField::Description => "description",
            CanonicalField::UnitPrice => "unitPrice",
            CanonicalField::Currency => "currency",
            CanonicalField::MinimumOrderQuantity => "minimumOrderQuantity",
            CanonicalField::UnitOfMeasure => "unitOfMeasure",
            CanonicalField::Category => "category",
        }
    }

    pub fn parse(s: &str) -> Option<CanonicalField> {
        let compact: String = s
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        CanonicalField::ALL
            .iter()
            .copied()
            .find(|f| f.as_str().to_lowercase() == compact)
    }

    /// 必填字段: 缺失时映射器不猜测，返回候选建议
    pub fn is_required(&self) -> bool {
        matches!(self, CanonicalField::Sku | CanonicalField::UnitPrice)
    }

    /// 精确匹配别名（已规范化: 小写 + 仅字母数字）
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            CanonicalField::Sku => &[
                "sku",
                "itemcode",
                "itemno",
                "itemnumber",
                "itemid",
                "productcode",
                "productid",
                "partnumber",
                "partno",
                "articlenumber",
                "articleno",
                "code",
                "ref",
                "reference",
                "materialnumber",
            ],
            CanonicalField::Description => &[
                "description",
                "desc",
                "productname",
                "itemname",
                "itemdescription",
                "productdescription",
                "name",
                "title",
                "designation",
            ],
            CanonicalField::UnitPrice => &[
                "unitprice",
                "price",
                "netprice",
                "listprice",
                "cost",
                "unitcost",
                "priceperunit",
                "rate",
                "amount",
            ],
            CanonicalField::Currency => &["currency", "curr", "ccy", "currencycode", "iso"],
            CanonicalField::MinimumOrderQuantity => &[
                "minimumorderquantity",
                "moq",
                "minqty",
                "minorderqty",
                "minimumqty",
                "minorder",
                "minimumorder",
                "minquantity",
            ],
            CanonicalField::UnitOfMeasure => &[
                "unitofmeasure",
                "uom",
                "unit",
                "units",
                "measure",
                "packunit",
            ],
            CanonicalField::Category => &[
                "category",
                "productcategory",
                "group",
                "productgroup",
                "family",
                "class",
                "segment",
            ],
        }
    }

    /// 模糊匹配使用的可读名称（空格分词）
    pub fn fuzzy_names(&self) -> &'static [&'static str] {
        match self {
            CanonicalField::Sku => &["sku", "item code", "product code", "part number", "article number"],
            CanonicalField::Description => &["description", "product name", "item description"],
            CanonicalField::UnitPrice => &["unit price", "price", "net price", "list price", "unit cost"],
            CanonicalField::Currency => &["currency", "currency code"],
            CanonicalField::MinimumOrderQuantity => {
                &["minimum order quantity", "min order qty", "moq", "minimum quantity"]
            }
            CanonicalField::UnitOfMeasure => &["unit of measure", "uom", "unit"],
            CanonicalField::Category => &["category", "product category", "product group"],
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
