// ==========================================
// 价目表导入系统 - 列映射反馈 Repository
// ==========================================
// 职责: LearningStore 的 SQLite 实现（mapping_feedback 表）
// 主键: (规范化表头, 规范字段)
// ==========================================

use crate::domain::types::CanonicalField;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::price_list_importer_trait::{LearnedWeight, LearningStore};
use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct SqliteLearningStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLearningStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        let store = Self { conn };
        {
            let conn = store.get_conn()?;
            crate::db::ensure_schema(&conn)?;
        }
        Ok(store)
    }

    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(format!("锁获取失败: {}", e)))
    }

    fn load_rows(&self) -> RepositoryResult<Vec<LearnedWeight>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT header_key, field, confirmations, rejections FROM mapping_feedback ORDER BY header_key, field",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(header_key, field, confirmations, rejections)| {
                let field = CanonicalField::parse(&field).ok_or_else(|| RepositoryError::FieldValueError {
                    field: "field".to_string(),
                    message: format!("未知规范字段: {}", field),
                })?;
                Ok(LearnedWeight {
                    header_key,
                    field,
                    confirmations,
                    rejections,
                })
            })
            .collect()
    }

    fn save_row(&self, weight: &LearnedWeight) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO mapping_feedback (header_key, field, confirmations, rejections, updated_at)
            VALUES (?1, ?2, ?3, ?4, datetime('now'))
            ON CONFLICT(header_key, field) DO UPDATE SET
                confirmations = excluded.confirmations,
                rejections = excluded.rejections,
                updated_at = excluded.updated_at
            "#,
            params![
                weight.header_key,
                weight.field.as_str(),
                weight.confirmations,
                weight.rejections
            ],
        )?;
        Ok(())
    }
}

impl LearningStore for SqliteLearningStore {
    fn load_all(&self) -> ImportResult<Vec<LearnedWeight>> {
        self.load_rows().map_err(ImportError::from)
    }

    fn save(&self, weight: &LearnedWeight) -> ImportResult<()> {
        self.save_row(weight).map_err(ImportError::from)
    }
}
