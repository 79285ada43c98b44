// ==========================================
// 价目表导入系统 - 流水线组件 Trait
// ==========================================
// 职责: 定义可替换的组件接口（不包含实现）
// - FormatParser: 每种文件格式一个实现，经注册表按格式选取
// - LearningStore: 列映射学习权重的持久化
// ==========================================

use crate::domain::price_list::ParsedTable;
use crate::domain::types::{CanonicalField, FileFormat};
use crate::importer::error::ImportResult;
use serde::{Deserialize, Serialize};

// ==========================================
// 解析参数
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    pub max_bytes: u64,  // 字节上限（解码前检查）
    pub max_rows: usize, // 数据行上限（读取中检查）
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024,
            max_rows: 100_000,
        }
    }
}

// ==========================================
// FormatParser Trait
// ==========================================
// 用途: 字节 → 表头 + 数据行
// 实现者: CsvParser, ExcelParser, JsonParser, XmlParser,
//         PdfParser, WordParser, EmailParser
pub trait FormatParser: Send + Sync {
    /// 该实现负责的格式
    fn format(&self) -> FileFormat;

    /// 解析原始字节
    ///
    /// # 返回
    /// - Ok(ParsedTable): 表头唯一化后的表格（至少一行数据）
    /// - Err(ParseError / RowLimitExceeded): 解析失败或超过行数上限
    fn parse(&self, bytes: &[u8], options: &ParseOptions) -> ImportResult<ParsedTable>;
}

// ==========================================
// LearningStore Trait
// ==========================================

/// 单个 (表头, 字段) 组合的人工反馈计数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnedWeight {
    pub header_key: String, // 规范化表头（小写 + 仅字母数字）
    pub field: CanonicalField,
    pub confirmations: u32,
    pub rejections: u32,
}

impl LearnedWeight {
    pub fn new(header_key: impl Into<String>, field: CanonicalField) -> Self {
        Self {
            header_key: header_key.into(),
            field,
            confirmations: 0,
            rejections: 0,
        }
    }

    pub fn net(&self) -> i64 {
        self.confirmations as i64 - self.rejections as i64
    }

    /// 否定多于确认: 该组合被排除
    pub fn is_excluded(&self) -> bool {
        self.rejections > self.confirmations
    }
}

// 用途: 启动时加载全部权重，每次反馈后持久化单条
// 实现者: InMemoryLearningStore, JsonFileLearningStore, SqliteLearningStore
pub trait LearningStore: Send + Sync {
    fn load_all(&self) -> ImportResult<Vec<LearnedWeight>>;

    fn save(&self, weight: &LearnedWeight) -> ImportResult<()>;
}
