// ==========================================
// 价目表导入系统 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)，键名 ingest/<字段名>
// 缺省: 未配置的键回退到 IngestConfig::default()
// ==========================================

use crate::config::ingest_config::{IngestConfig, IngestConfigReader};
use crate::db::open_sqlite_connection;
use crate::importer::error::{ImportError, ImportResult};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::error::Error;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::debug;

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> Result<Self, Box<dyn Error>> {
        let conn = open_sqlite_connection(db_path)?;
        crate::db::ensure_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：为保证连接行为一致，会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Result<Self, Box<dyn Error>> {
        {
            let conn_guard = conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
            crate::db::configure_sqlite_connection(&conn_guard)?;
            crate::db::ensure_schema(&conn_guard)?;
        }

        Ok(Self { conn })
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    fn get_config_value(&self, key: &str) -> ImportResult<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ImportError::SystemError(format!("锁获取失败: {}", e)))?;

        conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|e| ImportError::SystemError(format!("配置读取失败 {}: {}", key, e)))
    }

    /// 写入 global scope 的配置值（UPSERT）
    pub fn set_config_value(&self, key: &str, value: &str) -> ImportResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ImportError::SystemError(format!("锁获取失败: {}", e)))?;
        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )
        .map_err(|e| ImportError::SystemError(format!("配置写入失败 {}: {}", key, e)))?;
        debug!(key = %key, "配置已写入");
        Ok(())
    }

    /// 读取并解析单个键；未配置时保留默认值
    fn read_into<T>(&self, key: &str, target: &mut T) -> ImportResult<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.get_config_value(key)? {
            *target = raw.trim().parse::<T>().map_err(|e| {
                ImportError::InvalidOptions(format!("配置值无效 {}={}: {}", key, raw, e))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl IngestConfigReader for ConfigManager {
    async fn load_ingest_config(&self) -> ImportResult<IngestConfig> {
        let mut config = IngestConfig::default();
        self.read_into(config_keys::FUZZY_THRESHOLD, &mut config.fuzzy_threshold)?;
        self.read_into(config_keys::MIN_MAPPING_CONFIDENCE, &mut config.min_mapping_confidence)?;
        self.read_into::<Decimal>(config_keys::MIN_PRICE, &mut config.min_price)?;
        self.read_into::<Decimal>(config_keys::MAX_PRICE, &mut config.max_price)?;
        self.read_into(config_keys::SKU_PATTERN, &mut config.sku_pattern)?;
        self.read_into(config_keys::DESCRIPTION_MAX_LEN, &mut config.description_max_len)?;
        self.read_into(config_keys::DEFAULT_CURRENCY, &mut config.default_currency)?;
        self.read_into(config_keys::EXTRACTION_TIMEOUT_MS, &mut config.extraction_timeout_ms)?;
        self.read_into(config_keys::MAX_FILE_BYTES, &mut config.max_file_bytes)?;
        self.read_into(config_keys::MAX_ROWS, &mut config.max_rows)?;
        self.read_into(config_keys::PREVIEW_LIMIT, &mut config.preview_limit)?;
        self.read_into(config_keys::JOB_RETENTION_DAYS, &mut config.job_retention_days)?;

        if !(0.0..=1.0).contains(&config.fuzzy_threshold) {
            return Err(ImportError::InvalidOptions(format!(
                "fuzzy_threshold 必须在 0-1 之间: {}",
                config.fuzzy_threshold
            )));
        }
        if config.min_price > config.max_price {
            return Err(ImportError::InvalidOptions(format!(
                "min_price {} 大于 max_price {}",
                config.min_price, config.max_price
            )));
        }
        Ok(config)
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 列映射
    pub const FUZZY_THRESHOLD: &str = "ingest/fuzzy_threshold";
    pub const MIN_MAPPING_CONFIDENCE: &str = "ingest/min_mapping_confidence";

    // 规则校验
    pub const MIN_PRICE: &str = "ingest/min_price";
    pub const MAX_PRICE: &str = "ingest/max_price";
    pub const SKU_PATTERN: &str = "ingest/sku_pattern";
    pub const DESCRIPTION_MAX_LEN: &str = "ingest/description_max_len";
    pub const DEFAULT_CURRENCY: &str = "ingest/default_currency";

    // 解析
    pub const EXTRACTION_TIMEOUT_MS: &str = "ingest/extraction_timeout_ms";
    pub const MAX_FILE_BYTES: &str = "ingest/max_file_bytes";
    pub const MAX_ROWS: &str = "ingest/max_rows";

    // 编排
    pub const PREVIEW_LIMIT: &str = "ingest/preview_limit";
    pub const JOB_RETENTION_DAYS: &str = "ingest/job_retention_days";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConfigManager {
        let conn = Connection::open_in_memory().unwrap();
        ConfigManager::from_connection(Arc::new(Mutex::new(conn))).unwrap()
    }

    #[tokio::test]
    async fn test_defaults_when_unset() {
        let config = manager().load_ingest_config().await.unwrap();
        assert_eq!(config, IngestConfig::default());
    }

    #[tokio::test]
    async fn test_overrides_from_config_kv() {
        let manager = manager();
        manager.set_config_value(config_keys::FUZZY_THRESHOLD, "0.85").unwrap();
        manager.set_config_value(config_keys::MIN_PRICE, "0.50").unwrap();
        manager.set_config_value(config_keys::DEFAULT_CURRENCY, "EUR").unwrap();
        manager.set_config_value(config_keys::PREVIEW_LIMIT, "5").unwrap();
        manager.set_config_value(config_keys::PREVIEW_LIMIT, "7").unwrap();

        let config = manager.load_ingest_config().await.unwrap();
        assert_eq!(config.fuzzy_threshold, 0.85);
        assert_eq!(config.min_price, Decimal::new(50, 2));
        assert_eq!(config.default_currency, "EUR");
        assert_eq!(config.preview_limit, 7);
    }

    #[tokio::test]
    async fn test_malformed_value_is_invalid_options() {
        let manager = manager();
        manager.set_config_value(config_keys::MAX_ROWS, "many").unwrap();
        let err = manager.load_ingest_config().await.unwrap_err();
        assert!(matches!(err, ImportError::InvalidOptions(_)));
    }
}
