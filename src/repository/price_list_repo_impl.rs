// ==========================================
// 价目表导入系统 - 目录/价目表 Repository 实现
// ==========================================
// 职责: SupplierDirectory / ExistingItemsLookup / PriceListPersistence 的 SQLite 实现
// 并发: 新 SKU 在写入事务内再次校验唯一性，失败 → DuplicateConflict
// 红线: Repository 不含业务规则，只做数据 CRUD
// ==========================================

use crate::domain::price_list::{
    CatalogItem, PriceListMeta, PriceListRecord, PriceListStatus, PricedItem, Supplier,
};
use crate::domain::types::WriteMode;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::price_list_repo::{ExistingItemsLookup, PriceListPersistence, SupplierDirectory};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

pub struct SqlitePriceListRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePriceListRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        let repo = Self { conn };
        {
            let conn = repo.get_conn()?;
            crate::db::ensure_schema(&conn)?;
        }
        Ok(repo)
    }

    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(format!("锁获取失败: {}", e)))
    }

    /// 写入/更新供应商（初始化数据、测试用）
    pub fn upsert_supplier(&self, supplier: &Supplier) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO supplier (supplier_id, name, active) VALUES (?1, ?2, ?3)
            ON CONFLICT(supplier_id) DO UPDATE SET name = excluded.name, active = excluded.active
            "#,
            params![supplier.supplier_id, supplier.name, supplier.active],
        )?;
        Ok(())
    }

    /// 直接写入一条有效目录项（初始化数据、测试用）
    pub fn insert_catalog_item(&self, item: &CatalogItem) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let extra_json = serde_json::to_string(&item.extra)?;
        conn.execute(
            r#"
            INSERT INTO catalog_item (
                item_id, supplier_id, price_list_id, sku, description, unit_price, currency,
                minimum_order_quantity, unit_of_measure, category, extra_json, active, updated_at
            ) VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11)
            "#,
            params![
                item.item_id,
                item.supplier_id,
                item.sku,
                item.description,
                item.unit_price.to_string(),
                item.currency,
                item.minimum_order_quantity,
                item.unit_of_measure,
                item.category,
                extra_json,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| map_unique(e, &item.supplier_id, &item.sku))?;
        Ok(())
    }

    /// 价目表下的有效条目数
    pub fn count_items(&self, price_list_id: &str) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM catalog_item WHERE price_list_id = ?1 AND active = 1",
            params![price_list_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn find_price_list(&self, price_list_id: &str) -> RepositoryResult<Option<PriceListRecord>> {
        let conn = self.get_conn()?;
        let record = conn
            .query_row(
                r#"
                SELECT price_list_id, supplier_id, upload_id, name, status, currency, item_count, created_at
                FROM price_list WHERE price_list_id = ?1
                "#,
                params![price_list_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, supplier_id, upload_id, name, status, currency, item_count, created_at)) = record else {
            return Ok(None);
        };
        let status = match status.as_str() {
            "active" => PriceListStatus::Active,
            "draft" => PriceListStatus::Draft,
            other => {
                return Err(RepositoryError::FieldValueError {
                    field: "status".to_string(),
                    message: format!("未知价目表状态: {}", other),
                })
            }
        };
        let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| RepositoryError::FieldValueError {
                field: "created_at".to_string(),
                message: e.to_string(),
            })?
            .with_timezone(&Utc);

        Ok(Some(PriceListRecord {
            price_list_id: id,
            meta: PriceListMeta {
                supplier_id,
                upload_id,
                name,
                status,
                currency,
                item_count: item_count as usize,
            },
            created_at,
        }))
    }

    fn insert_item_tx(
        tx: &Transaction,
        price_list_id: &str,
        supplier_id: &str,
        priced: &PricedItem,
        now: &str,
    ) -> RepositoryResult<()> {
        let item = &priced.item;
        let exists: Option<String> = tx
            .query_row(
                "SELECT item_id FROM catalog_item WHERE supplier_id = ?1 AND sku = ?2 AND active = 1",
                params![supplier_id, item.sku],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(RepositoryError::DuplicateConflict {
                supplier_id: supplier_id.to_string(),
                sku: item.sku.clone(),
            });
        }

        let extra_json = serde_json::to_string(&item.extra)?;
        tx.execute(
            r#"
            INSERT INTO catalog_item (
                item_id, supplier_id, price_list_id, sku, description, unit_price, currency,
                minimum_order_quantity, unit_of_measure, category, extra_json, active, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12)
            "#,
            params![
                Uuid::new_v4().to_string(),
                supplier_id,
                price_list_id,
                item.sku,
                item.description,
                priced.final_unit_price.to_string(),
                item.currency,
                item.minimum_order_quantity,
                item.unit_of_measure,
                item.category,
                extra_json,
                now,
            ],
        )
        .map_err(|e| map_unique(e, supplier_id, &item.sku))?;
        Ok(())
    }

    fn replace_item_tx(
        tx: &Transaction,
        price_list_id: &str,
        existing_item_id: &str,
        priced: &PricedItem,
        now: &str,
    ) -> RepositoryResult<()> {
        let item = &priced.item;
        let extra_json = serde_json::to_string(&item.extra)?;
        let updated = tx.execute(
            r#"
            UPDATE catalog_item SET
                price_list_id = ?1, description = ?2, unit_price = ?3, currency = ?4,
                minimum_order_quantity = ?5, unit_of_measure = ?6, category = ?7,
                extra_json = ?8, updated_at = ?9
            WHERE item_id = ?10 AND active = 1
            "#,
            params![
                price_list_id,
                item.description,
                priced.final_unit_price.to_string(),
                item.currency,
                item.minimum_order_quantity,
                item.unit_of_measure,
                item.category,
                extra_json,
                now,
                existing_item_id,
            ],
        )?;
        if updated == 0 {
            return Err(RepositoryError::NotFound {
                entity: "CatalogItem".to_string(),
                id: existing_item_id.to_string(),
            });
        }
        Ok(())
    }
}

/// 唯一索引冲突 → DuplicateConflict
fn map_unique(err: rusqlite::Error, supplier_id: &str, sku: &str) -> RepositoryError {
    match RepositoryError::from(err) {
        RepositoryError::UniqueConstraintViolation(_) => RepositoryError::DuplicateConflict {
            supplier_id: supplier_id.to_string(),
            sku: sku.to_string(),
        },
        other => other,
    }
}

fn map_catalog_row(row: &Row) -> rusqlite::Result<(CatalogItem, String, String)> {
    Ok((
        CatalogItem {
            item_id: row.get(0)?,
            supplier_id: row.get(1)?,
            sku: row.get(2)?,
            description: row.get(3)?,
            unit_price: Decimal::ZERO,
            currency: row.get(5)?,
            minimum_order_quantity: row.get(6)?,
            unit_of_measure: row.get(7)?,
            category: row.get(8)?,
            extra: BTreeMap::new(),
        },
        row.get(4)?,
        row.get(9)?,
    ))
}

#[async_trait]
impl SupplierDirectory for SqlitePriceListRepository {
    async fn get(&self, supplier_id: &str) -> RepositoryResult<Option<Supplier>> {
        let conn = self.get_conn()?;
        let supplier = conn
            .query_row(
                "SELECT supplier_id, name, active FROM supplier WHERE supplier_id = ?1",
                params![supplier_id],
                |row| {
                    Ok(Supplier {
                        supplier_id: row.get(0)?,
                        name: row.get(1)?,
                        active: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(supplier)
    }
}

#[async_trait]
impl ExistingItemsLookup for SqlitePriceListRepository {
    async fn get_active_items(&self, supplier_id: &str) -> RepositoryResult<Vec<CatalogItem>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT item_id, supplier_id, sku, description, unit_price, currency,
                   minimum_order_quantity, unit_of_measure, category, extra_json
            FROM catalog_item
            WHERE supplier_id = ?1 AND active = 1
            ORDER BY item_id
            "#,
        )?;
        let rows = stmt
            .query_map(params![supplier_id], map_catalog_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(mut item, price, extra_json)| {
                item.unit_price = Decimal::from_str(&price).map_err(|e| RepositoryError::FieldValueError {
                    field: "unit_price".to_string(),
                    message: format!("{} ({})", e, price),
                })?;
                item.extra = serde_json::from_str(&extra_json)?;
                Ok(item)
            })
            .collect()
    }
}

#[async_trait]
impl PriceListPersistence for SqlitePriceListRepository {
    async fn create_price_list(&self, meta: &PriceListMeta) -> RepositoryResult<PriceListRecord> {
        let conn = self.get_conn()?;
        let record = PriceListRecord {
            price_list_id: Uuid::new_v4().to_string(),
            meta: meta.clone(),
            created_at: Utc::now(),
        };
        conn.execute(
            r#"
            INSERT INTO price_list (price_list_id, supplier_id, upload_id, name, status, currency, item_count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.price_list_id,
                meta.supplier_id,
                meta.upload_id,
                meta.name,
                meta.status.as_str(),
                meta.currency,
                meta.item_count as i64,
                record.created_at.to_rfc3339(),
            ],
        )?;
        debug!(price_list_id = %record.price_list_id, supplier_id = %meta.supplier_id, "价目表已创建");
        Ok(record)
    }

    async fn create_items(
        &self,
        price_list_id: &str,
        supplier_id: &str,
        batch: &[PricedItem],
    ) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();

        for priced in batch {
            match &priced.write_mode {
                WriteMode::Insert => Self::insert_item_tx(&tx, price_list_id, supplier_id, priced, &now)?,
                WriteMode::Replace { existing_item_id } => {
                    Self::replace_item_tx(&tx, price_list_id, existing_item_id, priced, &now)?
                }
            }
        }

        tx.commit()?;
        debug!(price_list_id = %price_list_id, committed = batch.len(), "批次已提交");
        Ok(batch.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::price_list::ValidatedItem;

    fn repo() -> SqlitePriceListRepository {
        let conn = Connection::open_in_memory().unwrap();
        let repo = SqlitePriceListRepository::new(Arc::new(Mutex::new(conn))).unwrap();
        repo.upsert_supplier(&Supplier {
            supplier_id: "S1".to_string(),
            name: "Acme".to_string(),
            active: true,
        })
        .unwrap();
        repo
    }

    fn priced(sku: &str, price: i64, write_mode: WriteMode) -> PricedItem {
        PricedItem {
            item: ValidatedItem {
                sku: sku.to_string(),
                description: "Widget".to_string(),
                unit_price: Decimal::from(price),
                currency: "USD".to_string(),
                minimum_order_quantity: None,
                unit_of_measure: None,
                category: None,
                row_number: 1,
                extra: BTreeMap::from([("color".to_string(), "blue".to_string())]),
            },
            write_mode,
            final_unit_price: Decimal::from(price),
            applied_rules: vec![],
        }
    }

    fn meta() -> PriceListMeta {
        PriceListMeta {
            supplier_id: "S1".to_string(),
            upload_id: "U1".to_string(),
            name: "test".to_string(),
            status: PriceListStatus::Active,
            currency: Some("USD".to_string()),
            item_count: 2,
        }
    }

    #[tokio::test]
    async fn test_create_items_and_read_back() {
        let repo = repo();
        let record = repo.create_price_list(&meta()).await.unwrap();
        let committed = repo
            .create_items(
                &record.price_list_id,
                "S1",
                &[priced("A1", 10, WriteMode::Insert), priced("A2", 20, WriteMode::Insert)],
            )
            .await
            .unwrap();
        assert_eq!(committed, 2);
        assert_eq!(repo.count_items(&record.price_list_id).unwrap(), 2);

        let items = repo.get_active_items("S1").await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items.iter().find(|i| i.sku == "A2").unwrap().unit_price, Decimal::from(20));
        assert_eq!(items[0].extra.get("color").map(String::as_str), Some("blue"));

        let found = repo.find_price_list(&record.price_list_id).unwrap().unwrap();
        assert_eq!(found.meta, meta());
    }

    #[tokio::test]
    async fn test_insert_existing_sku_is_conflict_and_rolls_back() {
        let repo = repo();
        let record = repo.create_price_list(&meta()).await.unwrap();
        repo.create_items(&record.price_list_id, "S1", &[priced("DUP1", 1, WriteMode::Insert)])
            .await
            .unwrap();

        let err = repo
            .create_items(
                &record.price_list_id,
                "S1",
                &[priced("NEW1", 1, WriteMode::Insert), priced("DUP1", 2, WriteMode::Insert)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::DuplicateConflict { ref sku, .. } if sku == "DUP1"));
        // 整批回滚
        assert_eq!(repo.get_active_items("S1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_updates_existing_item() {
        let repo = repo();
        repo.insert_catalog_item(&CatalogItem {
            item_id: "I1".to_string(),
            supplier_id: "S1".to_string(),
            sku: "A1".to_string(),
            description: "Old".to_string(),
            unit_price: Decimal::from(10),
            currency: "USD".to_string(),
            minimum_order_quantity: None,
            unit_of_measure: None,
            category: None,
            extra: BTreeMap::new(),
        })
        .unwrap();
        let record = repo.create_price_list(&meta()).await.unwrap();
        repo.create_items(
            &record.price_list_id,
            "S1",
            &[priced("A1", 12, WriteMode::Replace { existing_item_id: "I1".to_string() })],
        )
        .await
        .unwrap();

        let items = repo.get_active_items("S1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_id, "I1");
        assert_eq!(items[0].unit_price, Decimal::from(12));
    }

    #[tokio::test]
    async fn test_unknown_supplier() {
        let repo = repo();
        assert!(repo.get("NOPE").await.unwrap().is_none());
        assert!(repo.get("S1").await.unwrap().unwrap().active);
    }
}
