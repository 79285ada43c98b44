// ==========================================
// 价目表导入系统 - SQLite 连接初始化
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为（外键、busy_timeout）
// - 统一建表入口，参考实现的各仓储共用一套 schema
// ==========================================

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要“每个连接”单独开启
/// - busy_timeout 需要“每个连接”单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 建表（幂等）并写入 schema_version
pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
          version INTEGER PRIMARY KEY,
          applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS config_kv (
          scope_id TEXT NOT NULL,
          key TEXT NOT NULL,
          value TEXT NOT NULL,
          updated_at TEXT NOT NULL DEFAULT (datetime('now')),
          PRIMARY KEY (scope_id, key)
        );

        CREATE TABLE IF NOT EXISTS supplier (
          supplier_id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS price_list (
          price_list_id TEXT PRIMARY KEY,
          supplier_id TEXT NOT NULL REFERENCES supplier(supplier_id),
          upload_id TEXT NOT NULL,
          name TEXT NOT NULL,
          status TEXT NOT NULL CHECK(status IN ('active', 'draft')),
          currency TEXT,
          item_count INTEGER NOT NULL DEFAULT 0,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS catalog_item (
          item_id TEXT PRIMARY KEY,
          supplier_id TEXT NOT NULL REFERENCES supplier(supplier_id),
          price_list_id TEXT REFERENCES price_list(price_list_id),
          sku TEXT NOT NULL,
          description TEXT NOT NULL DEFAULT '',
          unit_price TEXT NOT NULL,
          currency TEXT NOT NULL,
          minimum_order_quantity INTEGER,
          unit_of_measure TEXT,
          category TEXT,
          extra_json TEXT NOT NULL DEFAULT '{}',
          active INTEGER NOT NULL DEFAULT 1,
          updated_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS ux_catalog_item_active_sku
          ON catalog_item(supplier_id, sku) WHERE active = 1;
        CREATE INDEX IF NOT EXISTS idx_catalog_item_price_list ON catalog_item(price_list_id);

        CREATE TABLE IF NOT EXISTS upload_job (
          upload_id TEXT PRIMARY KEY,
          supplier_id TEXT NOT NULL,
          status TEXT NOT NULL,
          checkpoint_json TEXT NOT NULL,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_upload_job_status ON upload_job(status);
        CREATE INDEX IF NOT EXISTS idx_upload_job_updated_at ON upload_job(updated_at);

        CREATE TABLE IF NOT EXISTS upload_status_log (
          log_id INTEGER PRIMARY KEY AUTOINCREMENT,
          upload_id TEXT NOT NULL,
          status TEXT NOT NULL,
          detail TEXT NOT NULL,
          logged_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_upload_status_log_upload ON upload_status_log(upload_id);

        CREATE TABLE IF NOT EXISTS mapping_feedback (
          header_key TEXT NOT NULL,
          field TEXT NOT NULL,
          confirmations INTEGER NOT NULL DEFAULT 0,
          rejections INTEGER NOT NULL DEFAULT 0,
          updated_at TEXT NOT NULL DEFAULT (datetime('now')),
          PRIMARY KEY (header_key, field)
        );
        "#,
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [CURRENT_SCHEMA_VERSION],
    )?;
    Ok(())
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}
