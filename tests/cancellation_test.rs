// ==========================================
// 取消与审批互斥测试
// ==========================================
// 测试目标: 运行中的任务在阶段/批次边界响应取消；
//           同一任务的 approve / cancel 不会并发推进
// ==========================================


use async_trait::async_trait;
use price_list_ingest::config::IngestConfig;
use price_list_ingest::domain::price_list::{
    ApprovalOverrides, CatalogItem, JobCheckpoint, PriceListMeta, PriceListRecord, PricedItem,
    UploadJob, UploadOptions, UploadPayload, UploadRequest,
};
use price_list_ingest::domain::types::UploadStatus;
use price_list_ingest::engine::{UploadCollaborators, UploadOrchestrator};
use price_list_ingest::importer::{ImportError, InMemoryLearningStore};
use price_list_ingest::logging;
use price_list_ingest::repository::{
    ExistingItemsLookup, InMemoryUploadJobStore, PriceListPersistence, RepositoryResult,
    UploadCheckpointStore,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use test_helpers::{csv_bytes, MemoryCatalog, SUPPLIER_ID};
use tokio::sync::Notify;

/// 协作方调用挂起点: 调用方进入后等待放行
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

/// 读取现有目录时挂起
struct GatedLookup {
    gate: Arc<Gate>,
}

#[async_trait]
impl ExistingItemsLookup for GatedLookup {
    async fn get_active_items(&self, _supplier_id: &str) -> RepositoryResult<Vec<CatalogItem>> {
        self.gate.pass().await;
        Ok(Vec::new())
    }
}

/// 第一批写入时挂起
struct GatedPersistence {
    inner: Arc<MemoryCatalog>,
    gate: Arc<Gate>,
    calls: AtomicUsize,
}

#[async_trait]
impl PriceListPersistence for GatedPersistence {
    async fn create_price_list(&self, meta: &PriceListMeta) -> RepositoryResult<PriceListRecord> {
        self.inner.create_price_list(meta).await
    }

    async fn create_items(
        &self,
        price_list_id: &str,
        supplier_id: &str,
        batch: &[PricedItem],
    ) -> RepositoryResult<usize> {
        let written = self.inner.create_items(price_list_id, supplier_id, batch).await?;
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.gate.pass().await;
        }
        Ok(written)
    }
}

/// 启用后下一次 load 挂起
struct GatedCheckpoints {
    inner: Arc<InMemoryUploadJobStore>,
    armed: AtomicBool,
    gate: Arc<Gate>,
}

#[async_trait]
impl UploadCheckpointStore for GatedCheckpoints {
    async fn save(&self, checkpoint: &JobCheckpoint) -> RepositoryResult<()> {
        self.inner.save(checkpoint).await
    }

    async fn load(&self, upload_id: &str) -> RepositoryResult<Option<JobCheckpoint>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.gate.pass().await;
        }
        self.inner.load(upload_id).await
    }

    async fn list_jobs(&self) -> RepositoryResult<Vec<UploadJob>> {
        self.inner.list_jobs().await
    }

    async fn delete(&self, upload_id: &str) -> RepositoryResult<bool> {
        self.inner.delete(upload_id).await
    }
}

fn orchestrator(collaborators: UploadCollaborators) -> UploadOrchestrator {
    UploadOrchestrator::new(
        collaborators,
        IngestConfig::default(),
        Arc::new(InMemoryLearningStore::new()),
    )
    .unwrap()
}

fn three_rows(options: UploadOptions) -> UploadRequest {
    let bytes = csv_bytes(
        &["SKU", "Description", "Price"],
        &[&["A1", "One", "1.00"], &["A2", "Two", "2.00"], &["A3", "Three", "3.00"]],
    );
    UploadRequest::new(bytes, "prices.csv", "text/csv", SUPPLIER_ID).with_options(options)
}

async fn only_upload_id(orchestrator: &UploadOrchestrator) -> String {
    let jobs = orchestrator.list_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    jobs[0].upload_id.clone()
}

#[tokio::test]
async fn test_cancel_running_job_between_stages() {
    logging::init_test();
    let catalog = MemoryCatalog::with_supplier(SUPPLIER_ID);
    let jobs = Arc::new(InMemoryUploadJobStore::new());
    let gate = Arc::new(Gate::default());
    let lookup = Arc::new(GatedLookup { gate: gate.clone() });
    let orchestrator = orchestrator(UploadCollaborators::new(
        catalog.clone(),
        lookup,
        catalog.clone(),
        jobs.clone(),
        jobs,
    ));

    let control = async {
        gate.entered.notified().await;
        let upload_id = only_upload_id(&orchestrator).await;
        let ack = orchestrator
            .cancel(&upload_id, Some("供应商撤回".to_string()))
            .await
            .unwrap();
        // 运行中的任务不接受审批
        let err = orchestrator
            .approve(&upload_id, ApprovalOverrides::default())
            .await
            .unwrap_err();
        gate.release.notify_one();
        (ack, err)
    };
    let (outcome, (ack, err)) = tokio::join!(
        orchestrator.start_upload(three_rows(UploadOptions::default())),
        control
    );
    let outcome = outcome.unwrap();

    assert_eq!(ack.status, UploadStatus::CheckingDuplicates);
    assert!(matches!(ack.payload, UploadPayload::Cancelled { .. }));
    assert!(matches!(err, ImportError::InvalidStateTransition { .. }));

    assert_eq!(outcome.status, UploadStatus::Cancelled);
    assert_eq!(catalog.persistence_calls(), 0);
    let job = orchestrator.get_job(&outcome.upload_id).await.unwrap();
    assert_eq!(job.status, UploadStatus::Cancelled);
    assert_eq!(job.status_message, "供应商撤回");
    assert_eq!(job.progress, UploadStatus::CheckingDuplicates.progress_milestone());
}

#[tokio::test]
async fn test_cancel_running_job_between_batches() {
    let catalog = MemoryCatalog::with_supplier(SUPPLIER_ID);
    let jobs = Arc::new(InMemoryUploadJobStore::new());
    let gate = Arc::new(Gate::default());
    let persistence = Arc::new(GatedPersistence {
        inner: catalog.clone(),
        gate: gate.clone(),
        calls: AtomicUsize::new(0),
    });
    let orchestrator = orchestrator(UploadCollaborators::new(
        catalog.clone(),
        catalog.clone(),
        persistence.clone(),
        jobs.clone(),
        jobs,
    ));

    let control = async {
        gate.entered.notified().await;
        let upload_id = only_upload_id(&orchestrator).await;
        orchestrator.cancel(&upload_id, None).await.unwrap();
        gate.release.notify_one();
    };
    let options = UploadOptions {
        batch_size: 1,
        ..UploadOptions::default()
    };
    let (outcome, ()) = tokio::join!(orchestrator.start_upload(three_rows(options)), control);
    let outcome = outcome.unwrap();

    assert_eq!(outcome.status, UploadStatus::Cancelled);
    // 已提交的第一批保留，后续批次不再写入
    assert_eq!(persistence.calls.load(Ordering::SeqCst), 1);
    assert_eq!(catalog.written_items().len(), 1);
    let job = orchestrator.get_job(&outcome.upload_id).await.unwrap();
    assert!(job.progress >= 80 && job.progress < 100);
}

#[tokio::test]
async fn test_cancel_waits_out_approval_in_flight() {
    let catalog = MemoryCatalog::with_supplier(SUPPLIER_ID);
    let jobs = Arc::new(InMemoryUploadJobStore::new());
    let gate = Arc::new(Gate::default());
    let checkpoints = Arc::new(GatedCheckpoints {
        inner: jobs.clone(),
        armed: AtomicBool::new(false),
        gate: gate.clone(),
    });
    let orchestrator = orchestrator(UploadCollaborators::new(
        catalog.clone(),
        catalog.clone(),
        catalog.clone(),
        jobs,
        checkpoints.clone(),
    ));

    let options = UploadOptions {
        require_approval: true,
        ..UploadOptions::default()
    };
    let waiting = orchestrator.start_upload(three_rows(options)).await.unwrap();
    assert_eq!(waiting.status, UploadStatus::WaitingForApproval);
    let upload_id = waiting.upload_id.clone();

    // approve 占用任务后在读取检查点处挂起
    checkpoints.armed.store(true, Ordering::SeqCst);
    let control = async {
        gate.entered.notified().await;
        let ack = orchestrator.cancel(&upload_id, Some("价格待确认".to_string())).await.unwrap();
        let second = orchestrator
            .approve(&upload_id, ApprovalOverrides::default())
            .await
            .unwrap_err();
        gate.release.notify_one();
        (ack, second)
    };
    let (approved, (ack, second)) = tokio::join!(
        orchestrator.approve(&upload_id, ApprovalOverrides::default()),
        control
    );

    assert!(matches!(ack.payload, UploadPayload::Cancelled { .. }));
    assert!(matches!(second, ImportError::InvalidStateTransition { .. }));
    assert_eq!(approved.unwrap().status, UploadStatus::Cancelled);
    assert_eq!(catalog.persistence_calls(), 0);

    let job = orchestrator.get_job(&upload_id).await.unwrap();
    assert_eq!(job.status, UploadStatus::Cancelled);
    assert_eq!(job.status_message, "价格待确认");
}
