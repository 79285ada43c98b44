// ==========================================
// 并发上传测试
// ==========================================
// 测试目标: 两个任务在快照阶段都把同一 SKU 视为新条目，
//           写入时由唯一性校验裁决，只有一个成功
// ==========================================


use async_trait::async_trait;
use price_list_ingest::config::IngestConfig;
use price_list_ingest::domain::price_list::{CatalogItem, UploadOptions, UploadPayload, UploadRequest};
use price_list_ingest::domain::types::{DuplicateHandling, UploadStatus};
use price_list_ingest::engine::{UploadCollaborators, UploadOrchestrator};
use price_list_ingest::logging;
use price_list_ingest::repository::{
    ExistingItemsLookup, RepositoryResult, SqliteLearningStore, SqlitePriceListRepository,
    SqliteUploadJobRepository,
};
use std::sync::Arc;
use test_helpers::{active_supplier, csv_bytes, SUPPLIER_ID};
use tokio::sync::Barrier;

/// 读完快照后等待另一任务也读完
struct BarrierLookup {
    inner: Arc<SqlitePriceListRepository>,
    barrier: Barrier,
}

#[async_trait]
impl ExistingItemsLookup for BarrierLookup {
    async fn get_active_items(&self, supplier_id: &str) -> RepositoryResult<Vec<CatalogItem>> {
        let items = self.inner.get_active_items(supplier_id).await?;
        self.barrier.wait().await;
        Ok(items)
    }
}

fn warn_request(sku: &str) -> UploadRequest {
    let bytes = csv_bytes(&["SKU", "Description", "Price"], &[&[sku, "Shared part", "4.20"]]);
    UploadRequest::new(bytes, "prices.csv", "text/csv", SUPPLIER_ID).with_options(UploadOptions {
        duplicate_handling: DuplicateHandling::Warn,
        ..UploadOptions::default()
    })
}

#[tokio::test]
async fn test_concurrent_jobs_race_on_new_sku() {
    logging::init_test();
    let (_temp, db_path) = test_helpers::create_test_db().unwrap();
    let conn = test_helpers::open_shared(&db_path);

    let repo = Arc::new(SqlitePriceListRepository::new(conn.clone()).unwrap());
    repo.upsert_supplier(&active_supplier(SUPPLIER_ID)).unwrap();
    let jobs = Arc::new(SqliteUploadJobRepository::new(conn.clone()).unwrap());
    let lookup = Arc::new(BarrierLookup {
        inner: repo.clone(),
        barrier: Barrier::new(2),
    });

    let collaborators = UploadCollaborators::new(repo.clone(), lookup, repo.clone(), jobs.clone(), jobs);
    let orchestrator = UploadOrchestrator::new(
        collaborators,
        IngestConfig::default(),
        Arc::new(SqliteLearningStore::new(conn).unwrap()),
    )
    .unwrap();

    let results = orchestrator
        .start_uploads(vec![warn_request("DUP1"), warn_request("DUP1")])
        .await;
    let outcomes: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();

    let completed: Vec<_> = outcomes
        .iter()
        .filter(|o| o.status == UploadStatus::Completed)
        .collect();
    let failed: Vec<_> = outcomes
        .iter()
        .filter(|o| o.status == UploadStatus::Failed)
        .collect();
    assert_eq!(completed.len(), 1, "只有一个任务应写入成功");
    assert_eq!(failed.len(), 1);

    match &failed[0].payload {
        UploadPayload::Failed { errors, .. } => {
            let last = errors.last().unwrap();
            assert_eq!(last.code, "DuplicateConflict");
            assert!(last.message.contains("DUP1"));
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    let active = repo.get_active_items(SUPPLIER_ID).await.unwrap();
    assert_eq!(active.iter().filter(|i| i.sku == "DUP1").count(), 1);
}

#[tokio::test]
async fn test_independent_jobs_run_concurrently() {
    let (_temp, db_path) = test_helpers::create_test_db().unwrap();
    let conn = test_helpers::open_shared(&db_path);
    let repo = Arc::new(SqlitePriceListRepository::new(conn.clone()).unwrap());
    repo.upsert_supplier(&active_supplier(SUPPLIER_ID)).unwrap();
    let jobs = Arc::new(SqliteUploadJobRepository::new(conn.clone()).unwrap());

    let collaborators = UploadCollaborators::new(repo.clone(), repo.clone(), repo.clone(), jobs.clone(), jobs);
    let orchestrator = UploadOrchestrator::new(
        collaborators,
        IngestConfig::default(),
        Arc::new(SqliteLearningStore::new(conn).unwrap()),
    )
    .unwrap();

    let requests = (1..=4).map(|i| warn_request(&format!("PART-{}", i))).collect();
    let outcomes = orchestrator.start_uploads(requests).await;
    assert!(outcomes
        .iter()
        .all(|o| o.as_ref().map(|o| o.status == UploadStatus::Completed).unwrap_or(false)));

    let ids: std::collections::HashSet<_> = outcomes
        .iter()
        .map(|o| o.as_ref().unwrap().upload_id.clone())
        .collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(repo.get_active_items(SUPPLIER_ID).await.unwrap().len(), 4);
}
