// ==========================================
// 价目表导入系统 - 导入层
// ==========================================
// 职责: 文件字节 → 规范化、去重后的目录条目
// 阶段: 解析 → 列映射 → 规则校验 → 重复处理
// 支持: CSV, Excel, JSON, XML, PDF, Word, Email
// ==========================================

// 模块声明
pub mod column_mapper;
pub mod data_cleaner;
pub mod document_parser;
pub mod duplicate_resolver;
pub mod error;
pub mod file_parser;
pub mod learning_store;
pub mod price_list_importer_trait;
pub mod rule_validator;
pub mod text_table;

// 重导出核心类型
pub use column_mapper::ColumnMapper;
pub use data_cleaner::{normalize_price_token, DataCleaner, PriceToken};
pub use document_parser::{EmailParser, PdfParser, WordParser};
pub use duplicate_resolver::DuplicateResolver;
pub use error::{ImportError, ImportResult};
pub use file_parser::{detect_format, CsvParser, ExcelParser, JsonParser, ParserRegistry, XmlParser};
pub use learning_store::{InMemoryLearningStore, JsonFileLearningStore};
pub use rule_validator::{RuleValidator, ValidationSettings};

// 重导出 Trait 接口
pub use price_list_importer_trait::{FormatParser, LearnedWeight, LearningStore, ParseOptions};
