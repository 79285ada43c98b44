// ==========================================
// 价目表导入系统 - 业务规则校验器
// ==========================================
// 阶段 2: 映射行 → 规范化条目
// 致命: 缺 SKU/单价、单价非数字、单价 <= 0 或低于下限
// 警告: 单价高于上限
// 按模式: SKU 格式、起订量、币种、描述超长、文件内重复 SKU
//         (strict → 致命, lenient → 警告并修正/回退)
// 上限: 致命错误数达到 maxErrors 后停止扫描
// ==========================================

use crate::config::ingest_config::IngestConfig;
use crate::domain::price_list::{
    ColumnMapping, MappedRow, UploadOptions, ValidatedItem, ValidationIssue, ValidationReport,
};
use crate::domain::types::{CanonicalField, Severity, ValidationMode};
use crate::importer::data_cleaner::{normalize_price_token, DataCleaner};
use crate::importer::error::{ImportError, ImportResult};
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::debug;

/// 单次校验的参数
#[derive(Debug, Clone)]
pub struct ValidationSettings {
    pub mode: ValidationMode,
    pub max_errors: usize,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub sku_pattern: Regex,
    pub description_max_len: usize,
    pub default_currency: String,
}

impl ValidationSettings {
    pub fn from_config(config: &IngestConfig, options: &UploadOptions) -> ImportResult<Self> {
        let sku_pattern = Regex::new(&config.sku_pattern).map_err(|e| {
            ImportError::InvalidOptions(format!("SKU 正则无效 {}: {}", config.sku_pattern, e))
        })?;
        Ok(Self {
            mode: ValidationMode::from_strict_flag(options.strict_validation),
            max_errors: options.max_errors,
            min_price: config.min_price,
            max_price: config.max_price,
            sku_pattern,
            description_max_len: config.description_max_len,
            default_currency: config.default_currency.to_ascii_uppercase(),
        })
    }
}

/// 单行校验的中间结果
#[derive(Default)]
struct RowCheck {
    warnings: Vec<ValidationIssue>,
    criticals: Vec<ValidationIssue>,
}

impl RowCheck {
    fn issue(
        &mut self,
        row_number: usize,
        field: CanonicalField,
        severity: Severity,
        message: String,
        value: Option<&str>,
    ) {
        let issue = ValidationIssue {
            row_number: Some(row_number),
            field: Some(field),
            severity,
            message,
            value: value.map(|v| v.to_string()),
        };
        match severity {
            Severity::Warning => self.warnings.push(issue),
            Severity::Critical => self.criticals.push(issue),
        }
    }
}

pub struct RuleValidator {
    cleaner: DataCleaner,
}

impl Default for RuleValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleValidator {
    pub fn new() -> Self {
        Self {
            cleaner: DataCleaner,
        }
    }

    /// strict 下为致命，lenient 下为警告
    fn mode_severity(settings: &ValidationSettings) -> Severity {
        match settings.mode {
            ValidationMode::Strict => Severity::Critical,
            ValidationMode::Lenient => Severity::Warning,
        }
    }

    pub fn validate(
        &self,
        rows: &[MappedRow],
        mapping: &ColumnMapping,
        settings: &ValidationSettings,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();
        let mut accepted_skus: HashSet<String> = HashSet::new();

        for row in rows {
            report.rows_scanned += 1;
            let mut check = RowCheck::default();
            let item = self.validate_row(row, mapping, settings, &accepted_skus, &mut check);

            report.warnings.extend(check.warnings);
            let remaining = settings.max_errors.saturating_sub(report.critical_errors.len());
            let has_critical = !check.criticals.is_empty();
            report
                .critical_errors
                .extend(check.criticals.into_iter().take(remaining));

            if !has_critical {
                if let Some(item) = item {
                    accepted_skus.insert(item.sku.clone());
                    report.valid_items.push(item);
                }
            }

            if report.critical_errors.len() >= settings.max_errors {
                report.truncated = report.rows_scanned < rows.len();
                debug!(
                    max_errors = settings.max_errors,
                    rows_scanned = report.rows_scanned,
                    "致命错误达到上限，停止扫描"
                );
                break;
            }
        }

        debug!(
            valid = report.valid_items.len(),
            warnings = report.warnings.len(),
            critical = report.critical_errors.len(),
            "数据校验完成"
        );
        report
    }

    fn validate_row(
        &self,
        row: &MappedRow,
        mapping: &ColumnMapping,
        settings: &ValidationSettings,
        accepted_skus: &HashSet<String>,
        check: &mut RowCheck,
    ) -> Option<ValidatedItem> {
        let n = row.row_number;
        let by_mode = Self::mode_severity(settings);

        // ----- SKU -----
        let sku = row.get(CanonicalField::Sku).map(|s| s.to_string());
        match &sku {
            None => check.issue(n, CanonicalField::Sku, Severity::Critical, "缺少 SKU".to_string(), None),
            Some(sku) => {
                if !settings.sku_pattern.is_match(sku) {
                    check.issue(
                        n,
                        CanonicalField::Sku,
                        by_mode,
                        format!("SKU 格式不符合规则: {}", sku),
                        Some(sku),
                    );
                }
                if accepted_skus.contains(sku) {
                    check.issue(
                        n,
                        CanonicalField::Sku,
                        by_mode,
                        format!("文件内重复 SKU，保留首次出现: {}", sku),
                        Some(sku),
                    );
                }
            }
        }
        let duplicate_in_file = sku.as_ref().map(|s| accepted_skus.contains(s)).unwrap_or(false);

        // ----- 单价 -----
        let raw_price = row.get(CanonicalField::UnitPrice);
        let token = match raw_price {
            None => {
                check.issue(n, CanonicalField::UnitPrice, Severity::Critical, "缺少单价".to_string(), None);
                None
            }
            Some(raw) => match normalize_price_token(raw) {
                None => {
                    check.issue(
                        n,
                        CanonicalField::UnitPrice,
                        Severity::Critical,
                        format!("单价不是有效数字: {}", raw),
                        Some(raw),
                    );
                    None
                }
                Some(token) => {
                    if token.amount <= Decimal::ZERO {
                        check.issue(
                            n,
                            CanonicalField::UnitPrice,
                            Severity::Critical,
                            format!("单价必须为正数: {}", token.amount),
                            Some(raw),
                        );
                    } else if token.amount < settings.min_price {
                        check.issue(
                            n,
                            CanonicalField::UnitPrice,
                            Severity::Critical,
                            format!("单价 {} 低于下限 {}", token.amount, settings.min_price),
                            Some(raw),
                        );
                    } else if token.amount > settings.max_price {
                        check.issue(
                            n,
                            CanonicalField::UnitPrice,
                            Severity::Warning,
                            format!("单价 {} 异常偏高（上限 {}）", token.amount, settings.max_price),
                            Some(raw),
                        );
                    }
                    Some(token)
                }
            },
        };

        // ----- 描述 -----
        let mut description = row.get(CanonicalField::Description).unwrap_or("").to_string();
        let length = description.chars().count();
        if length > settings.description_max_len {
            match settings.mode {
                ValidationMode::Strict => check.issue(
                    n,
                    CanonicalField::Description,
                    Severity::Critical,
                    format!("描述长度 {} 超过上限 {}", length, settings.description_max_len),
                    None,
                ),
                ValidationMode::Lenient => {
                    description = description.chars().take(settings.description_max_len).collect();
                    check.issue(
                        n,
                        CanonicalField::Description,
                        Severity::Warning,
                        format!("描述长度 {} 超过上限 {}，已截断", length, settings.description_max_len),
                        None,
                    );
                }
            }
        }

        // ----- 币种: 币种列 → 单价记号 → 表头推断 → 默认 -----
        let mut currency: Option<String> = None;
        if let Some(raw) = row.get(CanonicalField::Currency) {
            match self.cleaner.normalize_currency(raw) {
                Some(code) => currency = Some(code),
                None => check.issue(
                    n,
                    CanonicalField::Currency,
                    by_mode,
                    format!("币种代码无效: {}", raw),
                    Some(raw),
                ),
            }
        }
        let currency = currency
            .or_else(|| token.as_ref().and_then(|t| t.currency.clone()))
            .or_else(|| mapping.inferred_currency.clone())
            .unwrap_or_else(|| settings.default_currency.clone());

        // ----- 起订量 -----
        let mut minimum_order_quantity = None;
        if let Some(raw) = row.get(CanonicalField::MinimumOrderQuantity) {
            match self.cleaner.parse_quantity(raw) {
                Some(q) => minimum_order_quantity = Some(q),
                None => check.issue(
                    n,
                    CanonicalField::MinimumOrderQuantity,
                    by_mode,
                    format!("起订量必须为 >= 1 的整数: {}", raw),
                    Some(raw),
                ),
            }
        }

        let (Some(sku), Some(token)) = (sku, token) else {
            return None;
        };
        if duplicate_in_file {
            return None;
        }

        Some(ValidatedItem {
            sku,
            description,
            unit_price: token.amount,
            currency,
            minimum_order_quantity,
            unit_of_measure: self
                .cleaner
                .normalize_null(row.get(CanonicalField::UnitOfMeasure)),
            category: self.cleaner.normalize_null(row.get(CanonicalField::Category)),
            row_number: n,
            extra: row.extra.clone(),
        })
    }
}
