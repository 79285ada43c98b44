// ==========================================
// 价目表导入系统 - 上传编排器
// ==========================================
// 主流程: 供应商校验 → 解析 → 列映射 → 数据校验 → 重复检查
//         → 定价 → (预览/审批) → 分批导入
// 状态: 每次转换先写检查点，再写外部状态（尽力而为），最后发布事件
// 挂起: needs_review / waiting_for_approval 的中间产物全部落检查点，
//       approve 从受影响的最早阶段重跑
// 取消: 阶段之间、批次之间检查取消令牌
// ==========================================

use crate::config::{IngestConfig, IngestConfigReader};
use crate::domain::price_list::{
    ApprovalOverrides, DuplicateResolution, FileMetadata, JobCheckpoint, JobError, PriceListMeta, PriceListStatus,
    ReviewReason, UploadJob, UploadOutcome, UploadPayload, UploadRequest,
};
use crate::domain::types::{CanonicalField, UploadStatus, ValidationMode};
use crate::engine::collaborators::UploadCollaborators;
use crate::engine::events::{EventBus, ImportNotification, UploadEvent, UploadEventKind};
use crate::engine::price_rules::PriceRulesEngine;
use crate::importer::column_mapper::ColumnMapper;
use crate::importer::duplicate_resolver::DuplicateResolver;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::file_parser::ParserRegistry;
use crate::importer::price_list_importer_trait::{LearnedWeight, LearningStore};
use crate::importer::rule_validator::{RuleValidator, ValidationSettings};
use crate::repository::error::RepositoryError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// 导入完成通知主题
pub const IMPORTED_TOPIC: &str = "price_list.imported";

const DEFAULT_CANCEL_REASON: &str = "用户取消";

// ==========================================
// 阶段与中断
// ==========================================

/// 流水线阶段（按执行顺序排列，恢复时从某一阶段开始）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Supplier,
    Parse,
    Map,
    Validate,
    Duplicates,
    Pricing,
    Import,
}

/// 阶段执行被打断的原因
enum Interrupt {
    Cancelled,
    Failed(ImportError),
}

// 实现 From<ImportError>
impl From<ImportError> for Interrupt {
    fn from(err: ImportError) -> Self {
        Interrupt::Failed(err)
    }
}

// 实现 From<RepositoryError>
impl From<RepositoryError> for Interrupt {
    fn from(err: RepositoryError) -> Self {
        Interrupt::Failed(ImportError::Repository(err))
    }
}

type StageResult<T> = Result<T, Interrupt>;

/// 任务占用结果
enum RunClaim {
    Acquired(CancellationToken),
    Running(CancellationToken),
}

// ==========================================
// UploadOrchestrator - 上传编排器
// ==========================================

pub struct UploadOrchestrator {
    collaborators: UploadCollaborators,
    config: IngestConfig,
    registry: Arc<ParserRegistry>,
    mapper: Arc<ColumnMapper>,
    validator: RuleValidator,
    resolver: DuplicateResolver,
    pricing: PriceRulesEngine,
    events: Arc<EventBus>,
    // 运行中任务的取消令牌与取消原因
    running: Mutex<HashMap<String, CancellationToken>>,
    cancel_reasons: Mutex<HashMap<String, String>>,
    // 单任务事件序号
    sequences: Mutex<HashMap<String, u64>>,
}

impl UploadOrchestrator {
    /// 创建编排器
    ///
    /// # 参数
    /// - collaborators: 外部协作方
    /// - config: 导入参数
    /// - learning_store: 列映射学习权重存储
    pub fn new(
        collaborators: UploadCollaborators,
        config: IngestConfig,
        learning_store: Arc<dyn LearningStore>,
    ) -> ImportResult<Self> {
        let mapper = ColumnMapper::new(learning_store, config.fuzzy_threshold)?;
        info!(
            preview_limit = config.preview_limit,
            extraction_timeout_ms = config.extraction_timeout_ms,
            "上传编排器初始化完成"
        );
        Ok(Self {
            collaborators,
            config,
            registry: Arc::new(ParserRegistry::with_defaults()),
            mapper: Arc::new(mapper),
            validator: RuleValidator::new(),
            resolver: DuplicateResolver,
            pricing: PriceRulesEngine::new(),
            events: Arc::new(EventBus::new()),
            running: Mutex::new(HashMap::new()),
            cancel_reasons: Mutex::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
        })
    }

    /// 从配置读取器创建
    pub async fn from_reader(
        collaborators: UploadCollaborators,
        reader: &dyn IngestConfigReader,
        learning_store: Arc<dyn LearningStore>,
    ) -> ImportResult<Self> {
        let config = reader.load_ingest_config().await?;
        Self::new(collaborators, config, learning_store)
    }

    /// 替换解析器注册表
    pub fn with_registry(mut self, registry: ParserRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// 事件总线（注册监听器用）
    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    // ==========================================
    // 对外操作
    // ==========================================

    /// 提交一次上传并驱动到终态或挂起点
    ///
    /// # 返回
    /// - Ok(UploadOutcome): 任务结果（失败也以 Ok 返回，错误在 payload 中）
    /// - Err(InvalidOptions): 选项非法，不创建任务
    /// - Err(Repository): 初始检查点无法写入
    #[instrument(skip(self, request), fields(supplier_id = %request.supplier_id, file_name = %request.file_name))]
    pub async fn start_upload(&self, request: UploadRequest) -> ImportResult<UploadOutcome> {
        request.options.validate().map_err(ImportError::InvalidOptions)?;
        self.pricing.validate_rules(&request.options.price_rules_config)?;

        let upload_id = Uuid::new_v4().to_string();
        let file = FileMetadata {
            file_name: request.file_name.clone(),
            mime_type: request.mime_type.clone(),
            size_bytes: request.file_bytes.len() as u64,
        };
        let job = UploadJob::new(
            upload_id.clone(),
            request.supplier_id.clone(),
            file,
            request.options.clone(),
            Utc::now(),
        );
        let mut cp = JobCheckpoint::new(job);
        let token = self.register_run(&upload_id)?;
        if let Err(e) = self.collaborators.checkpoints.save(&cp).await {
            self.unregister_run(&upload_id);
            return Err(e.into());
        }
        self.report_status(&cp).await;
        info!(upload_id = %upload_id, size_bytes = cp.job.file.size_bytes, "上传任务已创建");

        self.emit(
            &upload_id,
            UploadEventKind::Started {
                supplier_id: request.supplier_id.clone(),
                file_name: request.file_name.clone(),
            },
        )
        .await;

        let outcome = self
            .drive(
                &mut cp,
                Some(&request.file_bytes),
                Stage::Supplier,
                &ApprovalOverrides::default(),
                false,
                &token,
            )
            .await;
        self.unregister_run(&upload_id);
        Ok(outcome)
    }

    /// 并发提交多个上传；结果顺序与请求一致
    pub async fn start_uploads(&self, requests: Vec<UploadRequest>) -> Vec<ImportResult<UploadOutcome>> {
        let futures = requests.into_iter().map(|r| self.start_upload(r));
        futures::future::join_all(futures).await
    }

    /// 审批挂起的任务，从受影响的最早阶段继续
    ///
    /// 覆写不足（必填字段仍未映射 / 重复仍缺决定）时任务保持挂起，返回对应错误
    #[instrument(skip_all, fields(upload_id = %upload_id))]
    pub async fn approve(&self, upload_id: &str, overrides: ApprovalOverrides) -> ImportResult<UploadOutcome> {
        // 先占用任务再读检查点，避免基于过期检查点重复执行
        let token = self.register_run(upload_id)?;
        let result = self.resume_claimed(upload_id, &overrides, &token).await;
        if result.is_err() && token.is_cancelled() {
            // 预检失败期间收到的取消仍需生效
            self.cancel_if_suspended(upload_id).await;
        }
        self.unregister_run(upload_id);
        result
    }

    async fn resume_claimed(
        &self,
        upload_id: &str,
        overrides: &ApprovalOverrides,
        token: &CancellationToken,
    ) -> ImportResult<UploadOutcome> {
        let mut cp = self.load_checkpoint(upload_id).await?;
        let status = cp.job.status;
        if !status.is_suspended() {
            return Err(ImportError::InvalidStateTransition {
                from: status.to_string(),
                to: "approve".to_string(),
            });
        }

        let mut start = match (status, cp.review_reason) {
            (UploadStatus::NeedsReview, Some(ReviewReason::DuplicatesPending)) => Stage::Duplicates,
            (UploadStatus::NeedsReview, _) => Stage::Validate,
            _ => Stage::Import,
        };

        // 覆写预检: 任何一项不成立都不改动任务
        if !overrides.column_mappings.is_empty() {
            let mut mapping = cp
                .mapping
                .clone()
                .ok_or_else(|| ImportError::SystemError("检查点缺少列映射".to_string()))?;
            for (field, header) in &overrides.column_mappings {
                ColumnMapper::apply_override(&mut mapping, *field, header)?;
            }
            let missing = mapping.missing_required();
            if !missing.is_empty() {
                return Err(ImportError::MappingUnresolved {
                    missing: missing.iter().map(|f| f.as_str().to_string()).collect(),
                });
            }
            cp.mapping = Some(mapping);
            start = Stage::Validate;
        } else if start == Stage::Validate {
            let missing = cp
                .mapping
                .as_ref()
                .map(|m| m.missing_required())
                .unwrap_or_else(|| vec![CanonicalField::Sku, CanonicalField::UnitPrice]);
            if !missing.is_empty() {
                return Err(ImportError::MappingUnresolved {
                    missing: missing.iter().map(|f| f.as_str().to_string()).collect(),
                });
            }
        }

        if start == Stage::Duplicates {
            let resolution = cp
                .duplicates
                .as_ref()
                .ok_or_else(|| ImportError::SystemError("检查点缺少重复检查结果".to_string()))?;
            self.resolver
                .apply_decisions(resolution, &overrides.duplicate_resolutions)?;
        } else if !overrides.duplicate_resolutions.is_empty() && start > Stage::Duplicates {
            start = Stage::Duplicates;
        }

        if !overrides.price_overrides.is_empty() {
            if let Some(priced) = &cp.priced {
                if start >= Stage::Pricing {
                    let mut trial = priced.clone();
                    self.pricing.apply_overrides(&mut trial, &overrides.price_overrides)?;
                }
            }
            if start > Stage::Pricing {
                start = Stage::Pricing;
            }
        }

        // 审批人确认过的映射计入学习权重
        for (field, header) in &overrides.column_mappings {
            if let Err(e) = self.mapper.learn_from_feedback(header, *field, true) {
                warn!(header = %header, field = %field, error = %e, "映射反馈写入失败");
            }
        }

        let approved = status == UploadStatus::WaitingForApproval;
        if status == UploadStatus::NeedsReview {
            cp.review_reason = None;
        }
        info!(from = %status, stage = ?start, approved, "审批通过，继续执行");

        Ok(self.drive(&mut cp, None, start, overrides, approved, token).await)
    }

    async fn cancel_if_suspended(&self, upload_id: &str) {
        match self.load_checkpoint(upload_id).await {
            Ok(mut cp) if cp.job.status.is_suspended() => {
                let reason = self.take_cancel_reason(upload_id);
                self.finish_cancelled(&mut cp, reason).await;
            }
            Ok(_) => {}
            Err(e) => warn!(upload_id = %upload_id, error = %e, "取消时读取检查点失败"),
        }
    }

    /// 取消任务
    ///
    /// - 运行中: 触发取消令牌，任务在下一个检查点结束
    /// - 挂起中: 立即取消并丢弃中间产物，不触发任何写入
    /// - 终态: InvalidStateTransition
    #[instrument(skip_all, fields(upload_id = %upload_id))]
    pub async fn cancel(&self, upload_id: &str, reason: Option<String>) -> ImportResult<UploadOutcome> {
        let reason = reason.unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

        match self.claim_run(upload_id)? {
            RunClaim::Running(token) => {
                self.cancel_reasons
                    .lock()
                    .map_err(|e| ImportError::SystemError(format!("锁获取失败: {}", e)))?
                    .insert(upload_id.to_string(), reason.clone());
                token.cancel();
                info!(reason = %reason, "已请求取消运行中的任务");
                let status = self.load_checkpoint(upload_id).await?.job.status;
                Ok(UploadOutcome {
                    success: true,
                    upload_id: upload_id.to_string(),
                    status,
                    payload: UploadPayload::Cancelled { reason },
                })
            }
            // 占用期间 approve 无法并发恢复同一任务
            RunClaim::Acquired(_) => {
                let result = self.cancel_claimed(upload_id, reason).await;
                self.unregister_run(upload_id);
                result
            }
        }
    }

    async fn cancel_claimed(&self, upload_id: &str, reason: String) -> ImportResult<UploadOutcome> {
        let mut cp = self.load_checkpoint(upload_id).await?;
        if cp.job.status.is_terminal() {
            return Err(ImportError::InvalidStateTransition {
                from: cp.job.status.to_string(),
                to: UploadStatus::Cancelled.to_string(),
            });
        }
        Ok(self.finish_cancelled(&mut cp, reason).await)
    }

    /// 查询任务
    pub async fn get_job(&self, upload_id: &str) -> ImportResult<UploadJob> {
        Ok(self.load_checkpoint(upload_id).await?.job)
    }

    /// 列出全部任务
    pub async fn list_jobs(&self) -> ImportResult<Vec<UploadJob>> {
        Ok(self.collaborators.checkpoints.list_jobs().await?)
    }

    /// 人工确认/否定一个列映射
    pub fn learn_from_feedback(
        &self,
        header: &str,
        field: CanonicalField,
        is_correct: bool,
    ) -> ImportResult<LearnedWeight> {
        self.mapper.learn_from_feedback(header, field, is_correct)
    }

    /// 清理超过保留期的终态任务
    ///
    /// # 返回
    /// 删除的任务数
    pub async fn archive_expired_jobs(&self, now: DateTime<Utc>) -> ImportResult<usize> {
        let cutoff = now - ChronoDuration::days(self.config.job_retention_days);
        let jobs = self.collaborators.checkpoints.list_jobs().await?;
        let mut removed = 0;
        for job in jobs {
            if job.status.is_terminal() && job.updated_at < cutoff {
                if self.collaborators.checkpoints.delete(&job.upload_id).await? {
                    removed += 1;
                }
            }
        }
        info!(removed, cutoff = %cutoff, "过期任务清理完成");
        Ok(removed)
    }

    // ==========================================
    // 流水线驱动
    // ==========================================

    async fn drive(
        &self,
        cp: &mut JobCheckpoint,
        bytes: Option<&[u8]>,
        from: Stage,
        overrides: &ApprovalOverrides,
        approved: bool,
        token: &CancellationToken,
    ) -> UploadOutcome {
        match self.run_stages(cp, bytes, from, overrides, approved, token).await {
            Ok(outcome) => outcome,
            Err(Interrupt::Cancelled) => {
                let reason = self.take_cancel_reason(&cp.job.upload_id);
                self.finish_cancelled(cp, reason).await
            }
            Err(Interrupt::Failed(err)) => self.finish_failed(cp, err).await,
        }
    }

    async fn run_stages(
        &self,
        cp: &mut JobCheckpoint,
        bytes: Option<&[u8]>,
        from: Stage,
        overrides: &ApprovalOverrides,
        approved: bool,
        token: &CancellationToken,
    ) -> StageResult<UploadOutcome> {
        Self::check_cancelled(token)?;

        if from <= Stage::Supplier {
            self.stage_supplier(cp).await?;
            Self::check_cancelled(token)?;
        }
        if from <= Stage::Parse {
            let bytes = bytes.ok_or_else(|| ImportError::SystemError("缺少文件内容".to_string()))?;
            self.stage_parse(cp, bytes).await?;
            Self::check_cancelled(token)?;
        }
        if from <= Stage::Map {
            if let Some(outcome) = self.stage_map(cp).await? {
                return Ok(outcome);
            }
            Self::check_cancelled(token)?;
        }
        if from <= Stage::Validate {
            self.stage_validate(cp).await?;
            Self::check_cancelled(token)?;
        }
        if from <= Stage::Duplicates {
            if let Some(outcome) = self.stage_duplicates(cp, overrides).await? {
                return Ok(outcome);
            }
            Self::check_cancelled(token)?;
        }
        if from <= Stage::Pricing {
            if let Some(outcome) = self.stage_pricing(cp, overrides, approved).await? {
                return Ok(outcome);
            }
            Self::check_cancelled(token)?;
        }
        self.stage_import(cp, token).await
    }

    // ===== 阶段 0: 供应商 =====
    async fn stage_supplier(&self, cp: &mut JobCheckpoint) -> StageResult<()> {
        self.transition(cp, UploadStatus::ValidatingSupplier, "校验供应商").await?;
        let supplier_id = cp.job.supplier_id.clone();
        match self.collaborators.suppliers.get(&supplier_id).await? {
            Some(supplier) if supplier.active => {
                debug!(supplier_id = %supplier_id, name = %supplier.name, "供应商有效");
                Ok(())
            }
            Some(_) => Err(ImportError::SupplierNotFound(format!("{}（已停用）", supplier_id)).into()),
            None => Err(ImportError::SupplierNotFound(supplier_id).into()),
        }
    }

    // ===== 阶段 1: 解析 =====
    async fn stage_parse(&self, cp: &mut JobCheckpoint, bytes: &[u8]) -> StageResult<()> {
        self.transition(cp, UploadStatus::ParsingFile, "解析文件").await?;

        let options = self.config.parse_options();
        self.registry.check_size(cp.job.file.size_bytes, &options)?;
        let parser = self.registry.resolve(&cp.job.file.file_name, &cp.job.file.mime_type)?;
        let format = parser.format();

        let owned = bytes.to_vec();
        let handle = tokio::task::spawn_blocking(move || parser.parse(&owned, &options));
        let joined = if format.is_structured() {
            handle.await
        } else {
            let limit_ms = self.config.extraction_timeout_ms;
            match tokio::time::timeout(Duration::from_millis(limit_ms), handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(format = %format, limit_ms, "非结构化提取超时");
                    return Err(ImportError::Timeout(limit_ms).into());
                }
            }
        };
        let table = joined.map_err(|e| ImportError::SystemError(format!("解析任务异常终止: {}", e)))??;

        info!(
            format = %format,
            rows = table.rows.len(),
            columns = table.headers.len(),
            heuristic = table.heuristic,
            "文件解析完成"
        );
        cp.table = Some(table);
        Ok(())
    }

    // ===== 阶段 2: 列映射 =====
    async fn stage_map(&self, cp: &mut JobCheckpoint) -> StageResult<Option<UploadOutcome>> {
        self.transition(cp, UploadStatus::MappingColumns, "映射列").await?;
        let table = cp
            .table
            .as_ref()
            .ok_or_else(|| ImportError::SystemError("检查点缺少解析结果".to_string()))?;
        let mapping = self
            .mapper
            .map_columns(table, cp.job.options.intelligent_parsing)?;

        let needs_review = mapping.requires_review(self.config.min_mapping_confidence);
        debug!(
            mapped = mapping.fields.len(),
            mean_confidence = mapping.mean_confidence(),
            needs_review,
            "列映射完成"
        );
        cp.mapping = Some(mapping);

        if needs_review {
            return Ok(Some(self.suspend_for_review(cp, ReviewReason::MappingIncomplete).await?));
        }
        Ok(None)
    }

    // ===== 阶段 3: 数据校验 =====
    async fn stage_validate(&self, cp: &mut JobCheckpoint) -> StageResult<()> {
        self.transition(cp, UploadStatus::ValidatingData, "校验数据").await?;
        let (table, mapping) = match (&cp.table, &cp.mapping) {
            (Some(table), Some(mapping)) => (table, mapping),
            _ => return Err(ImportError::SystemError("检查点缺少解析结果或列映射".to_string()).into()),
        };

        let settings = ValidationSettings::from_config(&self.config, &cp.job.options)?;
        let rows = ColumnMapper::map_rows(table, mapping);
        let report = self.validator.validate(&rows, mapping, &settings);

        // 重跑时以本次结果为准
        cp.duplicates = None;
        cp.resolved = None;
        cp.priced = None;
        cp.price_summary = None;
        cp.job.warnings = report
            .warnings
            .iter()
            .map(|issue| JobError::from_issue("ValidationError", issue))
            .collect();

        let critical: Vec<JobError> = report
            .critical_errors
            .iter()
            .map(|issue| JobError::from_issue("ValidationError", issue))
            .collect();
        let hit_cap = report.truncated || report.critical_errors.len() >= settings.max_errors;
        let strict_failure = settings.mode == ValidationMode::Strict && !critical.is_empty();
        let no_items = report.valid_items.is_empty();

        info!(
            valid = report.valid_items.len(),
            warnings = report.warnings.len(),
            critical = report.critical_errors.len(),
            rows_scanned = report.rows_scanned,
            "数据校验完成"
        );

        let failure = if hit_cap {
            Some(format!("致命错误达到上限 {}，已停止扫描", settings.max_errors))
        } else if strict_failure {
            Some(format!("strict 模式下存在 {} 个致命错误", critical.len()))
        } else if no_items {
            Some("没有可导入的有效条目".to_string())
        } else {
            None
        };

        cp.validation = Some(report);
        if let Some(message) = failure {
            cp.job.errors.extend(critical);
            return Err(ImportError::ValidationFailed(message).into());
        }

        // lenient: 致命行记为警告，任务继续
        cp.job.warnings.extend(critical);
        Ok(())
    }

    // ===== 阶段 4: 重复检查 =====
    async fn stage_duplicates(
        &self,
        cp: &mut JobCheckpoint,
        overrides: &ApprovalOverrides,
    ) -> StageResult<Option<UploadOutcome>> {
        self.transition(cp, UploadStatus::CheckingDuplicates, "检查重复").await?;
        let items = cp
            .validation
            .as_ref()
            .map(|r| r.valid_items.clone())
            .ok_or_else(|| ImportError::SystemError("检查点缺少校验结果".to_string()))?;

        let existing = self
            .collaborators
            .existing_items
            .get_active_items(&cp.job.supplier_id)
            .await?;
        let policy = cp.job.options.duplicate_handling;
        let mut resolution = self.resolver.resolve(&items, &existing, policy);

        if !overrides.duplicate_resolutions.is_empty() {
            match self
                .resolver
                .apply_decisions(&resolution, &overrides.duplicate_resolutions)
            {
                Ok(decided) => resolution = decided,
                Err(e) => debug!(error = %e, "人工决定未覆盖全部重复"),
            }
        }

        let duplicate_count = resolution.duplicates().len();
        let requires_decision = resolution.requires_decision();
        info!(
            existing = existing.len(),
            duplicates = duplicate_count,
            policy = %policy,
            requires_decision,
            "重复检查完成"
        );

        if let DuplicateResolution::Resolved { items, .. } = &resolution {
            cp.resolved = Some(items.clone());
        }
        cp.duplicates = Some(resolution);

        if requires_decision {
            return Ok(Some(self.suspend_for_review(cp, ReviewReason::DuplicatesPending).await?));
        }
        Ok(None)
    }

    // ===== 阶段 5: 定价 =====
    async fn stage_pricing(
        &self,
        cp: &mut JobCheckpoint,
        overrides: &ApprovalOverrides,
        approved: bool,
    ) -> StageResult<Option<UploadOutcome>> {
        self.transition(cp, UploadStatus::ApplyingPriceRules, "应用定价规则").await?;
        let resolved = cp
            .resolved
            .as_ref()
            .ok_or_else(|| ImportError::SystemError("检查点缺少重复处理结果".to_string()))?;

        let (mut priced, mut summary) = self
            .pricing
            .apply(resolved, &cp.job.options.price_rules_config)?;
        if !overrides.price_overrides.is_empty() {
            let changed = self
                .pricing
                .apply_overrides(&mut priced, &overrides.price_overrides)?;
            summary.total_after = PriceRulesEngine::checked_total(&priced, |p| p.final_unit_price)?;
            info!(changed, "已应用人工改价");
        }
        cp.priced = Some(priced);
        cp.price_summary = Some(summary);

        if cp.job.options.needs_checkpoint_before_import() && !approved {
            let preview: Vec<_> = cp
                .priced
                .iter()
                .flatten()
                .take(self.config.preview_limit)
                .cloned()
                .collect();
            self.transition(cp, UploadStatus::WaitingForApproval, "等待导入审批")
                .await?;
            self.emit(
                &cp.job.upload_id,
                UploadEventKind::WaitingForApproval {
                    preview_items: preview.len(),
                },
            )
            .await;
            return Ok(Some(Self::outcome(
                cp,
                UploadPayload::WaitingForApproval {
                    preview,
                    summary: cp.summary(),
                },
            )));
        }
        Ok(None)
    }

    // ===== 阶段 6: 分批导入 =====
    async fn stage_import(&self, cp: &mut JobCheckpoint, token: &CancellationToken) -> StageResult<UploadOutcome> {
        self.transition(cp, UploadStatus::ImportingItems, "写入条目").await?;
        let priced = cp
            .priced
            .clone()
            .ok_or_else(|| ImportError::SystemError("检查点缺少定价结果".to_string()))?;
        let meta = Self::price_list_meta(cp);

        let price_list_id = match &cp.price_list_id {
            Some(id) => id.clone(),
            None => {
                let record = self
                    .collaborators
                    .persistence
                    .create_price_list(&meta)
                    .await
                    .map_err(|e| Self::persistence_failure(e, cp.committed_items))?;
                cp.price_list_id = Some(record.price_list_id.clone());
                self.collaborators.checkpoints.save(cp).await?;
                info!(price_list_id = %record.price_list_id, status = meta.status.as_str(), "价目表已创建");
                record.price_list_id
            }
        };

        let total = priced.len();
        let batch_size = cp.job.options.batch_size;
        let supplier_id = cp.job.supplier_id.clone();
        while cp.committed_items < total {
            Self::check_cancelled(token)?;
            let end = (cp.committed_items + batch_size).min(total);
            let batch = &priced[cp.committed_items..end];
            let written = self
                .collaborators
                .persistence
                .create_items(&price_list_id, &supplier_id, batch)
                .await
                .map_err(|e| Self::persistence_failure(e, cp.committed_items))?;
            cp.committed_items += written;

            // 80 → 99，完成时置 100
            let progress = 80 + (19 * cp.committed_items / total.max(1)) as u8;
            cp.job.progress = progress.min(99);
            cp.job.updated_at = Utc::now();
            self.collaborators.checkpoints.save(cp).await?;
            debug!(committed = cp.committed_items, total, "批次已提交");
            self.emit(&cp.job.upload_id, UploadEventKind::Progress { progress: cp.job.progress })
                .await;
        }

        let items_processed = cp.committed_items;
        self.transition(cp, UploadStatus::Completed, format!("已导入 {} 条", items_processed))
            .await?;
        self.emit(
            &cp.job.upload_id,
            UploadEventKind::Completed {
                price_list_id: price_list_id.clone(),
                items_processed,
            },
        )
        .await;
        self.forget_sequence(&cp.job.upload_id);

        if cp.job.options.notify_supplier {
            self.notify(cp, &price_list_id, meta);
        }

        info!(price_list_id = %price_list_id, items_processed, "导入完成");
        Ok(Self::outcome(
            cp,
            UploadPayload::Completed {
                price_list_id,
                items_processed,
                summary: cp.summary(),
            },
        ))
    }

    // ==========================================
    // 终止与挂起
    // ==========================================

    async fn suspend_for_review(&self, cp: &mut JobCheckpoint, reason: ReviewReason) -> ImportResult<UploadOutcome> {
        cp.review_reason = Some(reason);
        let message = match reason {
            ReviewReason::MappingIncomplete => "列映射需要人工复核",
            ReviewReason::DuplicatesPending => "重复条目等待处理决定",
        };
        self.transition(cp, UploadStatus::NeedsReview, message).await?;
        self.emit(&cp.job.upload_id, UploadEventKind::NeedsReview { reason })
            .await;

        let (mapping, duplicates, resolution_options) = match reason {
            ReviewReason::MappingIncomplete => (cp.mapping.clone(), Vec::new(), Vec::new()),
            ReviewReason::DuplicatesPending => match &cp.duplicates {
                Some(DuplicateResolution::RequiresDecision {
                    duplicates,
                    options,
                    ..
                }) => (None, duplicates.clone(), options.clone()),
                _ => (None, Vec::new(), Vec::new()),
            },
        };
        Ok(Self::outcome(
            cp,
            UploadPayload::NeedsReview {
                reason,
                mapping,
                duplicates,
                resolution_options,
            },
        ))
    }

    async fn finish_failed(&self, cp: &mut JobCheckpoint, err: ImportError) -> UploadOutcome {
        error!(upload_id = %cp.job.upload_id, code = err.code(), error = %err, "上传任务失败");
        cp.job.errors.push(err.to_job_error());
        if let Err(e) = self.transition(cp, UploadStatus::Failed, err.to_string()).await {
            error!(upload_id = %cp.job.upload_id, error = %e, "失败状态写入失败");
        }

        let mut error_codes: Vec<String> = cp.job.errors.iter().map(|e| e.code.clone()).collect();
        error_codes.dedup();
        self.emit(&cp.job.upload_id, UploadEventKind::Failed { error_codes })
            .await;
        self.forget_sequence(&cp.job.upload_id);

        Self::outcome(
            cp,
            UploadPayload::Failed {
                errors: cp.job.errors.clone(),
                warnings: cp.job.warnings.clone(),
            },
        )
    }

    async fn finish_cancelled(&self, cp: &mut JobCheckpoint, reason: String) -> UploadOutcome {
        cp.discard_artifacts();
        if let Err(e) = self.transition(cp, UploadStatus::Cancelled, reason.clone()).await {
            error!(upload_id = %cp.job.upload_id, error = %e, "取消状态写入失败");
        }
        self.emit(&cp.job.upload_id, UploadEventKind::Cancelled { reason: reason.clone() })
            .await;
        self.forget_sequence(&cp.job.upload_id);
        info!(upload_id = %cp.job.upload_id, reason = %reason, committed = cp.committed_items, "上传任务已取消");

        Self::outcome(cp, UploadPayload::Cancelled { reason })
    }

    // ==========================================
    // 状态转换
    // ==========================================

    /// 状态转换: 检查合法性 → 写检查点 → 外部状态 → 事件
    async fn transition(
        &self,
        cp: &mut JobCheckpoint,
        next: UploadStatus,
        message: impl Into<String>,
    ) -> ImportResult<()> {
        let from = cp.job.status;
        if !from.can_transition_to(next) {
            return Err(ImportError::InvalidStateTransition {
                from: from.to_string(),
                to: next.to_string(),
            });
        }

        let message = message.into();
        cp.job.status = next;
        cp.job.status_message = message.clone();
        if !matches!(next, UploadStatus::Failed | UploadStatus::Cancelled) {
            cp.job.progress = next.progress_milestone();
        }
        cp.job.updated_at = Utc::now();

        self.collaborators.checkpoints.save(cp).await?;
        self.report_status(cp).await;
        info!(upload_id = %cp.job.upload_id, from = %from, to = %next, progress = cp.job.progress, "{}", message);

        let upload_id = cp.job.upload_id.clone();
        self.emit(&upload_id, UploadEventKind::StatusChanged { from, to: next, message })
            .await;
        self.emit(&upload_id, UploadEventKind::Progress { progress: cp.job.progress })
            .await;
        Ok(())
    }

    /// 外部状态（失败只告警）
    async fn report_status(&self, cp: &JobCheckpoint) {
        if let Err(e) = self
            .collaborators
            .status_store
            .update(&cp.job.upload_id, cp.job.status, &cp.job.status_message)
            .await
        {
            warn!(upload_id = %cp.job.upload_id, status = %cp.job.status, error = %e, "状态存储更新失败");
        }
    }

    async fn emit(&self, upload_id: &str, kind: UploadEventKind) {
        let sequence = match self.sequences.lock() {
            Ok(mut sequences) => {
                let next = sequences.entry(upload_id.to_string()).or_insert(0);
                *next += 1;
                *next
            }
            Err(e) => {
                warn!(error = %e, "事件序号锁获取失败，跳过事件");
                return;
            }
        };
        self.events
            .publish(UploadEvent {
                upload_id: upload_id.to_string(),
                sequence,
                kind,
            })
            .await;
    }

    fn forget_sequence(&self, upload_id: &str) {
        if let Ok(mut sequences) = self.sequences.lock() {
            sequences.remove(upload_id);
        }
    }

    /// 完成通知（后台发送，不阻塞返回）
    fn notify(&self, cp: &JobCheckpoint, price_list_id: &str, meta: PriceListMeta) {
        let upload_id = cp.job.upload_id.clone();
        let notification = ImportNotification {
            topic: IMPORTED_TOPIC.to_string(),
            upload_id: upload_id.clone(),
            price_list_id: price_list_id.to_string(),
            meta: PriceListMeta {
                item_count: cp.committed_items,
                ..meta
            },
        };
        let notifier = self.collaborators.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(notification).await {
                warn!(upload_id = %upload_id, error = %e, "导入通知发送失败");
            }
        });
    }

    // ==========================================
    // 辅助
    // ==========================================

    async fn load_checkpoint(&self, upload_id: &str) -> ImportResult<JobCheckpoint> {
        self.collaborators
            .checkpoints
            .load(upload_id)
            .await?
            .ok_or_else(|| ImportError::JobNotFound(upload_id.to_string()))
    }

    fn lock_running(&self) -> ImportResult<std::sync::MutexGuard<'_, HashMap<String, CancellationToken>>> {
        self.running
            .lock()
            .map_err(|e| ImportError::SystemError(format!("锁获取失败: {}", e)))
    }

    /// 占用任务（检查与登记在同一把锁内完成）
    fn claim_run(&self, upload_id: &str) -> ImportResult<RunClaim> {
        let mut running = self.lock_running()?;
        if let Some(token) = running.get(upload_id) {
            return Ok(RunClaim::Running(token.clone()));
        }
        let token = CancellationToken::new();
        running.insert(upload_id.to_string(), token.clone());
        Ok(RunClaim::Acquired(token))
    }

    /// 登记运行中的任务；同一任务不允许并发执行
    fn register_run(&self, upload_id: &str) -> ImportResult<CancellationToken> {
        match self.claim_run(upload_id)? {
            RunClaim::Acquired(token) => Ok(token),
            RunClaim::Running(_) => Err(ImportError::InvalidStateTransition {
                from: "running".to_string(),
                to: "running".to_string(),
            }),
        }
    }

    fn take_cancel_reason(&self, upload_id: &str) -> String {
        self.cancel_reasons
            .lock()
            .ok()
            .and_then(|mut reasons| reasons.remove(upload_id))
            .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string())
    }

    fn unregister_run(&self, upload_id: &str) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(upload_id);
        }
        if let Ok(mut reasons) = self.cancel_reasons.lock() {
            reasons.remove(upload_id);
        }
    }

    fn check_cancelled(token: &CancellationToken) -> StageResult<()> {
        if token.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        Ok(())
    }

    /// 仓储错误 → 任务错误（保留已提交条数）
    fn persistence_failure(err: RepositoryError, committed: usize) -> ImportError {
        match err {
            RepositoryError::DuplicateConflict { sku, .. } => ImportError::DuplicateConflict {
                sku,
                message: format!("写入时唯一性校验失败，已提交 {} 条", committed),
            },
            other => ImportError::PersistenceError {
                message: other.to_string(),
                committed,
            },
        }
    }

    fn price_list_meta(cp: &JobCheckpoint) -> PriceListMeta {
        let priced = cp.priced.as_deref().unwrap_or_default();
        let currency = priced.first().map(|p| p.item.currency.clone()).filter(|first| {
            priced.iter().all(|p| &p.item.currency == first)
        });
        PriceListMeta {
            supplier_id: cp.job.supplier_id.clone(),
            upload_id: cp.job.upload_id.clone(),
            name: cp.job.file.file_name.clone(),
            status: if cp.job.options.auto_activate {
                PriceListStatus::Active
            } else {
                PriceListStatus::Draft
            },
            currency,
            item_count: priced.len(),
        }
    }

    fn outcome(cp: &JobCheckpoint, payload: UploadPayload) -> UploadOutcome {
        UploadOutcome {
            success: !matches!(payload, UploadPayload::Failed { .. }),
            upload_id: cp.job.upload_id.clone(),
            status: cp.job.status,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::price_list::{CatalogItem, PriceListRecord, PricedItem, Supplier, UploadOptions};
    use crate::engine::events::ChannelEventListener;
    use crate::importer::learning_store::InMemoryLearningStore;
    use crate::repository::error::RepositoryResult;
    use crate::repository::price_list_repo::{ExistingItemsLookup, PriceListPersistence, SupplierDirectory};
    use crate::repository::upload_job_repo::UploadCheckpointStore;
    use crate::repository::upload_job_repo_impl::InMemoryUploadJobStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MemCatalog {
        writes: AtomicUsize,
        items: Mutex<Vec<PricedItem>>,
    }

    #[async_trait]
    impl SupplierDirectory for MemCatalog {
        async fn get(&self, supplier_id: &str) -> RepositoryResult<Option<Supplier>> {
            Ok((supplier_id == "SUP1").then(|| Supplier {
                supplier_id: supplier_id.to_string(),
                name: "Acme".to_string(),
                active: true,
            }))
        }
    }

    #[async_trait]
    impl ExistingItemsLookup for MemCatalog {
        async fn get_active_items(&self, _supplier_id: &str) -> RepositoryResult<Vec<CatalogItem>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl PriceListPersistence for MemCatalog {
        async fn create_price_list(&self, meta: &PriceListMeta) -> RepositoryResult<PriceListRecord> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(PriceListRecord {
                price_list_id: "PL1".to_string(),
                meta: meta.clone(),
                created_at: Utc::now(),
            })
        }

        async fn create_items(
            &self,
            _price_list_id: &str,
            _supplier_id: &str,
            batch: &[PricedItem],
        ) -> RepositoryResult<usize> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.items.lock().unwrap().extend_from_slice(batch);
            Ok(batch.len())
        }
    }

    fn orchestrator() -> (UploadOrchestrator, Arc<MemCatalog>, Arc<InMemoryUploadJobStore>) {
        let catalog = Arc::new(MemCatalog::default());
        let jobs = Arc::new(InMemoryUploadJobStore::new());
        let collaborators = UploadCollaborators::new(
            catalog.clone(),
            catalog.clone(),
            catalog.clone(),
            jobs.clone(),
            jobs.clone(),
        );
        let orchestrator = UploadOrchestrator::new(
            collaborators,
            IngestConfig::default(),
            Arc::new(InMemoryLearningStore::new()),
        )
        .unwrap();
        (orchestrator, catalog, jobs)
    }

    fn csv_request(options: UploadOptions) -> UploadRequest {
        let csv = "SKU,Description,Price\nA1,Widget,10.00\nA2,Gadget,5.50\n";
        UploadRequest::new(csv.as_bytes().to_vec(), "prices.csv", "text/csv", "SUP1").with_options(options)
    }

    #[tokio::test]
    async fn test_happy_path_completes_with_ordered_events() {
        let (orchestrator, catalog, _jobs) = orchestrator();
        let (listener, mut rx) = ChannelEventListener::new();
        orchestrator.events().register(Arc::new(listener));

        let outcome = orchestrator.start_upload(csv_request(UploadOptions::default())).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.status, UploadStatus::Completed);
        assert_eq!(catalog.items.lock().unwrap().len(), 2);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.first().unwrap().kind.name(), "upload:started");
        assert_eq!(events.last().unwrap().kind.name(), "upload:completed");
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        let mut sorted = sequences.clone();
        sorted.sort();
        assert_eq!(sequences, sorted);

        let job = orchestrator.get_job(&outcome.upload_id).await.unwrap();
        assert_eq!(job.progress, 100);
    }

    #[tokio::test]
    async fn test_unknown_supplier_fails_without_writes() {
        let (orchestrator, catalog, _jobs) = orchestrator();
        let request = UploadRequest::new(b"SKU,Price\nA1,1\n".to_vec(), "p.csv", "text/csv", "NOPE");
        let outcome = orchestrator.start_upload(request).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status, UploadStatus::Failed);
        match outcome.payload {
            UploadPayload::Failed { errors, .. } => assert_eq!(errors[0].code, "SupplierNotFound"),
            other => panic!("unexpected payload: {:?}", other),
        }
        assert_eq!(catalog.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_job_creation() {
        let (orchestrator, _catalog, jobs) = orchestrator();
        let options = UploadOptions {
            batch_size: 0,
            ..UploadOptions::default()
        };
        let err = orchestrator.start_upload(csv_request(options)).await.unwrap_err();
        assert!(matches!(err, ImportError::InvalidOptions(_)));
        assert!(jobs.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_waiting_job_discards_artifacts() {
        let (orchestrator, catalog, jobs) = orchestrator();
        let options = UploadOptions {
            require_approval: true,
            ..UploadOptions::default()
        };
        let outcome = orchestrator.start_upload(csv_request(options)).await.unwrap();
        assert_eq!(outcome.status, UploadStatus::WaitingForApproval);
        let progress_before = orchestrator.get_job(&outcome.upload_id).await.unwrap().progress;

        let cancelled = orchestrator.cancel(&outcome.upload_id, Some("不需要了".to_string())).await.unwrap();
        assert_eq!(cancelled.status, UploadStatus::Cancelled);
        assert_eq!(catalog.writes.load(Ordering::SeqCst), 0);

        let cp = jobs.load(&outcome.upload_id).await.unwrap().unwrap();
        assert!(cp.priced.is_none());
        assert_eq!(cp.job.progress, progress_before);

        let err = orchestrator.cancel(&outcome.upload_id, None).await.unwrap_err();
        assert!(matches!(err, ImportError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_approve_requires_suspended_job() {
        let (orchestrator, _catalog, _jobs) = orchestrator();
        let outcome = orchestrator.start_upload(csv_request(UploadOptions::default())).await.unwrap();
        let err = orchestrator
            .approve(&outcome.upload_id, ApprovalOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::InvalidStateTransition { .. }));

        let err = orchestrator.approve("missing", ApprovalOverrides::default()).await.unwrap_err();
        assert!(matches!(err, ImportError::JobNotFound(_)));
    }

    struct StalledNotifier;

    #[async_trait]
    impl crate::engine::events::NotificationDispatcher for StalledNotifier {
        async fn notify(
            &self,
            _notification: ImportNotification,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_notifier_does_not_delay_completion() {
        let catalog = Arc::new(MemCatalog::default());
        let jobs = Arc::new(InMemoryUploadJobStore::new());
        let collaborators =
            UploadCollaborators::new(catalog.clone(), catalog.clone(), catalog.clone(), jobs.clone(), jobs)
                .with_notifier(Arc::new(StalledNotifier));
        let orchestrator = UploadOrchestrator::new(
            collaborators,
            IngestConfig::default(),
            Arc::new(InMemoryLearningStore::new()),
        )
        .unwrap();

        let options = UploadOptions {
            notify_supplier: true,
            ..UploadOptions::default()
        };
        let outcome = tokio::time::timeout(Duration::from_secs(5), orchestrator.start_upload(csv_request(options)))
            .await
            .expect("完成通知不应阻塞返回")
            .unwrap();
        assert_eq!(outcome.status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn test_archive_removes_only_expired_terminal_jobs() {
        let (orchestrator, _catalog, jobs) = orchestrator();
        let done = orchestrator.start_upload(csv_request(UploadOptions::default())).await.unwrap();
        let waiting = orchestrator
            .start_upload(csv_request(UploadOptions {
                require_preview: true,
                ..UploadOptions::default()
            }))
            .await
            .unwrap();

        let removed = orchestrator.archive_expired_jobs(Utc::now()).await.unwrap();
        assert_eq!(removed, 0);

        let later = Utc::now() + ChronoDuration::days(31);
        let removed = orchestrator.archive_expired_jobs(later).await.unwrap();
        assert_eq!(removed, 1);
        assert!(jobs.load(&done.upload_id).await.unwrap().is_none());
        assert!(jobs.load(&waiting.upload_id).await.unwrap().is_some());
    }
}
