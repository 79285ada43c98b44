// ==========================================
// 价目表导入系统 - 目录/价目表 Repository Trait
// ==========================================
// 职责: 定义编排器消费的外部协作方接口（不包含业务逻辑）
// 实现者: SqlitePriceListRepository（使用 rusqlite）、测试替身
// ==========================================

use crate::domain::price_list::{CatalogItem, PriceListMeta, PriceListRecord, PricedItem, Supplier};
use crate::repository::error::RepositoryResult;
use async_trait::async_trait;

// ==========================================
// SupplierDirectory Trait
// ==========================================
#[async_trait]
pub trait SupplierDirectory: Send + Sync {
    /// 查询供应商；不存在时返回 Ok(None)
    async fn get(&self, supplier_id: &str) -> RepositoryResult<Option<Supplier>>;
}

// ==========================================
// ExistingItemsLookup Trait
// ==========================================
#[async_trait]
pub trait ExistingItemsLookup: Send + Sync {
    /// 供应商当前有效目录项快照
    async fn get_active_items(&self, supplier_id: &str) -> RepositoryResult<Vec<CatalogItem>>;
}

// ==========================================
// PriceListPersistence Trait
// ==========================================
#[async_trait]
pub trait PriceListPersistence: Send + Sync {
    /// 创建价目表头
    async fn create_price_list(&self, meta: &PriceListMeta) -> RepositoryResult<PriceListRecord>;

    /// 写入一批条目（单事务）
    ///
    /// # 返回
    /// - Ok(usize): 本批提交条数
    /// - Err(DuplicateConflict): 新 SKU 在写入时已存在（整批回滚）
    async fn create_items(
        &self,
        price_list_id: &str,
        supplier_id: &str,
        batch: &[PricedItem],
    ) -> RepositoryResult<usize>;
}
