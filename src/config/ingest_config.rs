// ==========================================
// 价目表导入系统 - 导入配置
// ==========================================
// 职责: 导入流水线的全部可调参数 + 读取接口
// 红线: 不包含配置写入、不包含业务逻辑
// ==========================================

use crate::importer::error::ImportResult;
use crate::importer::price_list_importer_trait::ParseOptions;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    // ===== 列映射 =====
    pub fuzzy_threshold: f64,        // 模糊匹配阈值
    pub min_mapping_confidence: f64, // 低于此平均置信度 → needs_review

    // ===== 规则校验 =====
    pub min_price: Decimal, // 低于下限 → 致命
    pub max_price: Decimal, // 高于上限 → 警告
    pub sku_pattern: String,
    pub description_max_len: usize,
    pub default_currency: String,

    // ===== 解析 =====
    pub extraction_timeout_ms: u64, // 非结构化格式提取上限
    pub max_file_bytes: u64,
    pub max_rows: usize,

    // ===== 编排 =====
    pub preview_limit: usize,     // 待审批预览条数
    pub job_retention_days: i64,  // 终态任务保留天数
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.7,
            min_mapping_confidence: 0.6,
            min_price: Decimal::new(1, 2),
            max_price: Decimal::from(100_000),
            sku_pattern: r"^[A-Za-z0-9][A-Za-z0-9._/-]{0,63}$".to_string(),
            description_max_len: 500,
            default_currency: "USD".to_string(),
            extraction_timeout_ms: 30_000,
            max_file_bytes: 50 * 1024 * 1024,
            max_rows: 100_000,
            preview_limit: 20,
            job_retention_days: 30,
        }
    }
}

impl IngestConfig {
    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            max_bytes: self.max_file_bytes,
            max_rows: self.max_rows,
        }
    }
}

// ==========================================
// IngestConfigReader Trait
// ==========================================
// 实现者: ConfigManager（config_kv 表）、IngestConfig（静态配置）
#[async_trait]
pub trait IngestConfigReader: Send + Sync {
    async fn load_ingest_config(&self) -> ImportResult<IngestConfig>;
}

#[async_trait]
impl IngestConfigReader for IngestConfig {
    async fn load_ingest_config(&self) -> ImportResult<IngestConfig> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IngestConfig::default();
        assert_eq!(config.min_price.to_string(), "0.01");
        assert_eq!(config.parse_options().max_rows, 100_000);
        assert_eq!(config.parse_options().max_bytes, 52_428_800);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: IngestConfig = serde_json::from_str(r#"{"fuzzy_threshold": 0.8}"#).unwrap();
        assert_eq!(config.fuzzy_threshold, 0.8);
        assert_eq!(config.preview_limit, 20);
    }

    #[tokio::test]
    async fn test_static_reader() {
        let config = IngestConfig {
            preview_limit: 5,
            ..IngestConfig::default()
        };
        assert_eq!(config.load_ingest_config().await.unwrap().preview_limit, 5);
    }
}
