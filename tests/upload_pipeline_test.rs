// ==========================================
// 上传流水线集成测试
// ==========================================
// 测试目标: 编排器端到端行为（内存协作方 + SQLite 检查点恢复）
// ==========================================


use price_list_ingest::config::IngestConfig;
use price_list_ingest::domain::price_list::{
    ApprovalOverrides, ParsedTable, PriceListStatus, PriceRule, ReviewReason, UploadOptions,
    UploadPayload, UploadRequest,
};
use price_list_ingest::domain::types::{
    CanonicalField, DuplicateAction, DuplicateHandling, FileFormat, UploadStatus, WriteMode,
};
use price_list_ingest::engine::IMPORTED_TOPIC;
use price_list_ingest::importer::{FormatParser, ImportError, ImportResult, ParseOptions, ParserRegistry};
use price_list_ingest::logging;
use price_list_ingest::repository::{ExistingItemsLookup, SqlitePriceListRepository};
use price_list_ingest::UploadApi;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{catalog_item, csv_bytes, memory_harness, MemoryHarness, SUPPLIER_ID};

fn request(bytes: Vec<u8>, options: UploadOptions) -> UploadRequest {
    UploadRequest::new(bytes, "prices.csv", "text/csv", SUPPLIER_ID).with_options(options)
}

fn simple_csv() -> Vec<u8> {
    csv_bytes(
        &["SKU", "Description", "Price"],
        &[&["A1", "Widget", "10.00"], &["A2", "Gadget", "5.50"]],
    )
}

fn failed_codes(payload: &UploadPayload) -> Vec<String> {
    match payload {
        UploadPayload::Failed { errors, .. } => errors.iter().map(|e| e.code.clone()).collect(),
        other => panic!("期望 Failed，实际: {:?}", other),
    }
}

#[tokio::test]
async fn test_annotated_headers_with_markup() {
    logging::init_test();
    let h = memory_harness(IngestConfig::default());

    let bytes = csv_bytes(&["Item Code", "Desc", "Price (USD)"], &[&["SKU1", "Widget", "12.50"]]);
    let options = UploadOptions {
        price_rules_config: vec![PriceRule::markup_percent("markup", 1, Decimal::from(10))],
        ..UploadOptions::default()
    };
    let outcome = h.orchestrator.start_upload(request(bytes, options)).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.status, UploadStatus::Completed);
    match &outcome.payload {
        UploadPayload::Completed {
            items_processed,
            summary,
            ..
        } => {
            assert_eq!(*items_processed, 1);
            assert_eq!(summary.valid_items, 1);
            assert_eq!(summary.duplicates_found, 0);
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    let written = h.catalog.written_items();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].item.sku, "SKU1");
    assert_eq!(written[0].item.description, "Widget");
    assert_eq!(written[0].item.currency, "USD");
    assert_eq!(written[0].final_unit_price, Decimal::new(1375, 2));
    assert!(h.notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_while_waiting_for_approval_writes_nothing() {
    let h = memory_harness(IngestConfig::default());
    let options = UploadOptions {
        require_approval: true,
        ..UploadOptions::default()
    };
    let outcome = h.orchestrator.start_upload(request(simple_csv(), options)).await.unwrap();
    assert_eq!(outcome.status, UploadStatus::WaitingForApproval);
    match &outcome.payload {
        UploadPayload::WaitingForApproval { preview, summary } => {
            assert_eq!(preview.len(), 2);
            assert_eq!(summary.items_to_insert, 2);
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    let cancelled = h
        .orchestrator
        .cancel(&outcome.upload_id, Some("价格有误".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, UploadStatus::Cancelled);
    assert_eq!(h.catalog.persistence_calls(), 0);

    let job = h.orchestrator.get_job(&outcome.upload_id).await.unwrap();
    assert_eq!(job.status, UploadStatus::Cancelled);
    assert_eq!(job.status_message, "价格有误");
}

#[tokio::test]
async fn test_unmapped_sku_needs_review_then_manual_remap() {
    let h = memory_harness(IngestConfig::default());
    let bytes = csv_bytes(
        &["Artikel", "Bezeichnung", "Preis"],
        &[&["ART-1", "Widget", "10.00"], &["ART-2", "Gadget", "12.00"]],
    );

    let outcome = h
        .orchestrator
        .start_upload(request(bytes.clone(), UploadOptions::default()))
        .await
        .unwrap();
    assert_eq!(outcome.status, UploadStatus::NeedsReview);
    match &outcome.payload {
        UploadPayload::NeedsReview { reason, mapping, .. } => {
            assert_eq!(*reason, ReviewReason::MappingIncomplete);
            let mapping = mapping.as_ref().unwrap();
            assert!(mapping.missing_required().contains(&CanonicalField::Sku));
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    // 覆写不足: 任务保持 needs_review
    let mut insufficient = ApprovalOverrides::default();
    insufficient
        .column_mappings
        .insert(CanonicalField::Description, "Bezeichnung".to_string());
    let err = h
        .orchestrator
        .approve(&outcome.upload_id, insufficient)
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::MappingUnresolved { .. }));
    let job = h.orchestrator.get_job(&outcome.upload_id).await.unwrap();
    assert_eq!(job.status, UploadStatus::NeedsReview);
    assert_eq!(h.catalog.persistence_calls(), 0);

    let mut overrides = ApprovalOverrides::default();
    overrides.column_mappings.insert(CanonicalField::Sku, "Artikel".to_string());
    overrides.column_mappings.insert(CanonicalField::UnitPrice, "Preis".to_string());
    let approved = h.orchestrator.approve(&outcome.upload_id, overrides).await.unwrap();
    assert_eq!(approved.status, UploadStatus::Completed);
    let skus: Vec<String> = h.catalog.written_items().iter().map(|p| p.item.sku.clone()).collect();
    assert_eq!(skus, vec!["ART-1", "ART-2"]);

    // 审批确认的映射已被学习，同样的表头不再需要复核
    let second = h
        .orchestrator
        .start_upload(request(bytes, UploadOptions::default()))
        .await
        .unwrap();
    assert_eq!(second.status, UploadStatus::Completed);
}

#[tokio::test]
async fn test_manual_price_remap_uses_header_currency() {
    let h = memory_harness(IngestConfig::default());
    let bytes = csv_bytes(&["SKU", "Wert (EUR)"], &[&["A1", "10"]]);
    let outcome = h
        .orchestrator
        .start_upload(request(bytes, UploadOptions::default()))
        .await
        .unwrap();
    assert_eq!(outcome.status, UploadStatus::NeedsReview);

    let mut overrides = ApprovalOverrides::default();
    overrides
        .column_mappings
        .insert(CanonicalField::UnitPrice, "Wert (EUR)".to_string());
    let approved = h.orchestrator.approve(&outcome.upload_id, overrides).await.unwrap();
    assert_eq!(approved.status, UploadStatus::Completed);

    let currencies: Vec<String> = h.catalog.written_items().iter().map(|p| p.item.currency.clone()).collect();
    assert_eq!(currencies, vec!["EUR"]);
}

#[tokio::test]
async fn test_warn_policy_waits_for_duplicate_decisions() {
    let h = memory_harness(IngestConfig::default());
    h.catalog.add_existing(catalog_item("E1", "A1", "Old widget", "9.00"));

    let options = UploadOptions {
        duplicate_handling: DuplicateHandling::Warn,
        ..UploadOptions::default()
    };
    let outcome = h.orchestrator.start_upload(request(simple_csv(), options)).await.unwrap();
    assert_eq!(outcome.status, UploadStatus::NeedsReview);
    match &outcome.payload {
        UploadPayload::NeedsReview {
            reason,
            duplicates,
            resolution_options,
            ..
        } => {
            assert_eq!(*reason, ReviewReason::DuplicatesPending);
            assert_eq!(duplicates.len(), 1);
            assert_eq!(duplicates[0].sku, "A1");
            assert!(resolution_options.contains(&DuplicateAction::Overwrite));
        }
        other => panic!("unexpected payload: {:?}", other),
    }

    let err = h
        .orchestrator
        .approve(&outcome.upload_id, ApprovalOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::DuplicateConflict { .. }));
    let job = h.orchestrator.get_job(&outcome.upload_id).await.unwrap();
    assert_eq!(job.status, UploadStatus::NeedsReview);

    let mut overrides = ApprovalOverrides::default();
    overrides
        .duplicate_resolutions
        .insert("A1".to_string(), DuplicateAction::Overwrite);
    let approved = h.orchestrator.approve(&outcome.upload_id, overrides).await.unwrap();
    assert_eq!(approved.status, UploadStatus::Completed);

    let written = h.catalog.written_items();
    assert_eq!(written.len(), 2);
    assert_eq!(
        written[0].write_mode,
        WriteMode::Replace {
            existing_item_id: "E1".to_string()
        }
    );
    assert_eq!(written[1].write_mode, WriteMode::Insert);
}

#[tokio::test]
async fn test_merge_keeps_existing_description() {
    let h = memory_harness(IngestConfig::default());
    h.catalog.add_existing(catalog_item("E1", "A1", "Old", "10"));

    let bytes = csv_bytes(&["SKU", "Description", "Price"], &[&["A1", "", "12"]]);
    let options = UploadOptions {
        duplicate_handling: DuplicateHandling::Merge,
        ..UploadOptions::default()
    };
    let outcome = h.orchestrator.start_upload(request(bytes, options)).await.unwrap();
    assert_eq!(outcome.status, UploadStatus::Completed);

    let written = h.catalog.written_items();
    assert_eq!(written[0].item.description, "Old");
    assert_eq!(written[0].final_unit_price, Decimal::from(12));
}

#[tokio::test]
async fn test_price_overflow_fails_job_instead_of_panicking() {
    let h = memory_harness(IngestConfig::default());
    let bytes = csv_bytes(
        &["SKU", "Description", "Price"],
        &[&["BIG", "Huge", "70000000000000000000000000000"]],
    );
    let options = UploadOptions {
        price_rules_config: vec![PriceRule::markup_percent("markup", 1, Decimal::from(20))],
        ..UploadOptions::default()
    };
    let outcome = h.orchestrator.start_upload(request(bytes, options)).await.unwrap();

    assert_eq!(outcome.status, UploadStatus::Failed);
    assert_eq!(failed_codes(&outcome.payload).last().unwrap(), "PricingError");
    let job = h.orchestrator.get_job(&outcome.upload_id).await.unwrap();
    assert_eq!(job.status, UploadStatus::Failed);
    assert_eq!(h.catalog.persistence_calls(), 0);
}

#[tokio::test]
async fn test_strict_mode_fails_on_bad_row_lenient_continues() {
    let bytes = csv_bytes(
        &["SKU", "Description", "Price"],
        &[&["A1", "Widget", "10.00"], &["A2", "Gadget", "abc"]],
    );

    let h = memory_harness(IngestConfig::default());
    let strict = UploadOptions {
        strict_validation: true,
        ..UploadOptions::default()
    };
    let outcome = h.orchestrator.start_upload(request(bytes.clone(), strict)).await.unwrap();
    assert_eq!(outcome.status, UploadStatus::Failed);
    match &outcome.payload {
        UploadPayload::Failed { errors, .. } => {
            assert!(errors.iter().any(|e| e.code == "ValidationError" && e.row_number == Some(2)));
        }
        other => panic!("unexpected payload: {:?}", other),
    }
    assert_eq!(h.catalog.persistence_calls(), 0);

    let outcome = h
        .orchestrator
        .start_upload(request(bytes, UploadOptions::default()))
        .await
        .unwrap();
    assert_eq!(outcome.status, UploadStatus::Completed);
    let job = h.orchestrator.get_job(&outcome.upload_id).await.unwrap();
    assert!(job.warnings.iter().any(|w| w.row_number == Some(2)));
    assert_eq!(h.catalog.written_items().len(), 1);
}

#[tokio::test]
async fn test_partial_batch_failure_reports_committed_count() {
    let h = memory_harness(IngestConfig::default());
    h.catalog.fail_on_batch(2);

    let bytes = csv_bytes(
        &["SKU", "Price"],
        &[&["A1", "1.00"], &["A2", "2.00"], &["A3", "3.00"]],
    );
    let options = UploadOptions {
        batch_size: 1,
        ..UploadOptions::default()
    };
    let outcome = h.orchestrator.start_upload(request(bytes, options)).await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.status, UploadStatus::Failed);
    let codes = failed_codes(&outcome.payload);
    assert_eq!(codes.last().unwrap(), "PersistenceError");
    match &outcome.payload {
        UploadPayload::Failed { errors, .. } => {
            assert!(errors.last().unwrap().message.contains("已提交 1 条"));
        }
        _ => unreachable!(),
    }
    assert_eq!(h.catalog.written_items().len(), 1);

    let job = h.orchestrator.get_job(&outcome.upload_id).await.unwrap();
    assert!(job.progress >= 80 && job.progress < 100);
}

#[tokio::test]
async fn test_unsupported_format_fails_before_mapping() {
    let h = memory_harness(IngestConfig::default());
    let request = UploadRequest::new(vec![0x4d, 0x5a], "setup.exe", "application/octet-stream", SUPPLIER_ID);
    let outcome = h.orchestrator.start_upload(request).await.unwrap();

    assert_eq!(outcome.status, UploadStatus::Failed);
    assert_eq!(failed_codes(&outcome.payload), vec!["UnsupportedFormatError"]);
    assert_eq!(h.catalog.lookup_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(h.catalog.persistence_calls(), 0);
}

#[tokio::test]
async fn test_unknown_supplier_fails() {
    let h = memory_harness(IngestConfig::default());
    let request = UploadRequest::new(simple_csv(), "prices.csv", "text/csv", "NOBODY");
    let outcome = h.orchestrator.start_upload(request).await.unwrap();
    assert_eq!(failed_codes(&outcome.payload), vec!["SupplierNotFound"]);
}

/// 比提取上限慢的解析器
struct SlowPdfParser;

impl FormatParser for SlowPdfParser {
    fn format(&self) -> FileFormat {
        FileFormat::Pdf
    }

    fn parse(&self, _bytes: &[u8], _options: &ParseOptions) -> ImportResult<ParsedTable> {
        std::thread::sleep(Duration::from_millis(300));
        Err(ImportError::ParseError("too slow".to_string()))
    }
}

#[tokio::test]
async fn test_unstructured_extraction_timeout() {
    let config = IngestConfig {
        extraction_timeout_ms: 50,
        ..IngestConfig::default()
    };
    let MemoryHarness {
        orchestrator,
        catalog,
        ..
    } = memory_harness(config);
    let mut registry = ParserRegistry::with_defaults();
    registry.register(Arc::new(SlowPdfParser));
    let orchestrator = orchestrator.with_registry(registry);

    let request = UploadRequest::new(b"%PDF-1.4".to_vec(), "prices.pdf", "application/pdf", SUPPLIER_ID);
    let outcome = orchestrator.start_upload(request).await.unwrap();

    assert_eq!(outcome.status, UploadStatus::Failed);
    assert_eq!(failed_codes(&outcome.payload), vec!["TimeoutError"]);
    assert_eq!(catalog.persistence_calls(), 0);
}

#[tokio::test]
async fn test_completion_notification_carries_meta() {
    let h = memory_harness(IngestConfig::default());
    let options = UploadOptions {
        notify_supplier: true,
        auto_activate: false,
        ..UploadOptions::default()
    };
    let outcome = h.orchestrator.start_upload(request(simple_csv(), options)).await.unwrap();
    assert_eq!(outcome.status, UploadStatus::Completed);

    let sent = h.notifier.wait_for(1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, IMPORTED_TOPIC);
    assert_eq!(sent[0].upload_id, outcome.upload_id);
    assert_eq!(sent[0].meta.status, PriceListStatus::Draft);
    assert_eq!(sent[0].meta.currency.as_deref(), Some("USD"));
    assert_eq!(sent[0].meta.item_count, 2);
}

#[tokio::test]
async fn test_approval_survives_restart_with_price_override() {
    logging::init_test();
    let (_temp, db_path) = test_helpers::create_test_db().unwrap();

    let upload_id = {
        let api = UploadApi::new(&db_path).await.unwrap();
        api.register_supplier(&test_helpers::active_supplier(SUPPLIER_ID)).unwrap();
        let options = UploadOptions {
            require_preview: true,
            ..UploadOptions::default()
        };
        let outcome = api.upload(request(simple_csv(), options)).await.unwrap();
        assert_eq!(outcome.status, UploadStatus::WaitingForApproval);
        outcome.upload_id
    };

    // 新进程: 仅凭数据库中的检查点继续
    let api = UploadApi::new(&db_path).await.unwrap();
    let job = api.get_job(&upload_id).await.unwrap();
    assert_eq!(job.status, UploadStatus::WaitingForApproval);

    let mut price_overrides = BTreeMap::new();
    price_overrides.insert("A1".to_string(), Decimal::new(999, 2));
    let outcome = api
        .approve(
            &upload_id,
            ApprovalOverrides {
                price_overrides,
                ..ApprovalOverrides::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, UploadStatus::Completed);

    let price_list_id = match &outcome.payload {
        UploadPayload::Completed { price_list_id, .. } => price_list_id.clone(),
        other => panic!("unexpected payload: {:?}", other),
    };
    assert_eq!(api.count_price_list_items(&price_list_id).unwrap(), 2);
    assert_eq!(api.get_price_list(&price_list_id).unwrap().meta.status, PriceListStatus::Active);

    let repo = SqlitePriceListRepository::new(test_helpers::open_shared(&db_path)).unwrap();
    let items = repo.get_active_items(SUPPLIER_ID).await.unwrap();
    let a1 = items.iter().find(|i| i.sku == "A1").unwrap();
    assert_eq!(a1.unit_price, Decimal::new(999, 2));
}
