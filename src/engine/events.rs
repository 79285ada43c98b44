// ==========================================
// 价目表导入系统 - 上传事件发布
// ==========================================
// 职责: 编排器向外发布任务进度事件
// 投递: 按注册顺序；监听器出错时最多重试 3 次（至少一次语义）
// 说明: 监听器失败只记录日志，不影响任务
// ==========================================

use crate::domain::price_list::{PriceListMeta, ReviewReason};
use crate::domain::types::UploadStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 单个监听器的最大投递次数
pub const MAX_DELIVERY_ATTEMPTS: usize = 3;

// ==========================================
// 上传事件类型
// ==========================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UploadEventKind {
    Started { supplier_id: String, file_name: String },
    StatusChanged { from: UploadStatus, to: UploadStatus, message: String },
    Progress { progress: u8 },
    NeedsReview { reason: ReviewReason },
    WaitingForApproval { preview_items: usize },
    Completed { price_list_id: String, items_processed: usize },
    Failed { error_codes: Vec<String> },
    Cancelled { reason: String },
}

impl UploadEventKind {
    /// 事件名（upload:started 风格）
    pub fn name(&self) -> &'static str {
        match self {
            UploadEventKind::Started { .. } => "upload:started",
            UploadEventKind::StatusChanged { .. } => "upload:status",
            UploadEventKind::Progress { .. } => "upload:progress",
            UploadEventKind::NeedsReview { .. } => "upload:needs_review",
            UploadEventKind::WaitingForApproval { .. } => "upload:waiting_for_approval",
            UploadEventKind::Completed { .. } => "upload:completed",
            UploadEventKind::Failed { .. } => "upload:failed",
            UploadEventKind::Cancelled { .. } => "upload:cancelled",
        }
    }
}

/// 上传事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvent {
    pub upload_id: String,
    /// 单任务内单调递增
    pub sequence: u64,
    pub kind: UploadEventKind,
}

// ==========================================
// 监听器 Trait
// ==========================================

#[async_trait]
pub trait UploadEventListener: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, event: &UploadEvent) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// 空操作监听器
///
/// 用于不需要事件的场景（如单元测试）
#[derive(Debug, Clone, Default)]
pub struct NoOpEventListener;

#[async_trait]
impl UploadEventListener for NoOpEventListener {
    fn name(&self) -> &str {
        "noop"
    }

    async fn on_event(&self, event: &UploadEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        debug!(
            upload_id = %event.upload_id,
            event = event.kind.name(),
            "NoOpEventListener: 跳过事件"
        );
        Ok(())
    }
}

/// 基于 tokio mpsc 的监听器
pub struct ChannelEventListener {
    sender: mpsc::UnboundedSender<UploadEvent>,
}

impl ChannelEventListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl UploadEventListener for ChannelEventListener {
    fn name(&self) -> &str {
        "channel"
    }

    async fn on_event(&self, event: &UploadEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.sender
            .send(event.clone())
            .map_err(|e| format!("事件通道已关闭: {}", e).into())
    }
}

// ==========================================
// 事件总线
// ==========================================

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn UploadEventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn UploadEventListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(e) => warn!("事件监听器注册失败: 锁获取失败: {}", e),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    /// 按注册顺序投递
    pub async fn publish(&self, event: UploadEvent) {
        let listeners: Vec<Arc<dyn UploadEventListener>> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(e) => {
                warn!("事件发布失败: 锁获取失败: {}", e);
                return;
            }
        };

        for listener in listeners {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match listener.on_event(&event).await {
                    Ok(()) => break,
                    Err(e) if attempt < MAX_DELIVERY_ATTEMPTS => {
                        debug!(
                            listener = listener.name(),
                            attempt,
                            error = %e,
                            "事件投递失败，重试"
                        );
                    }
                    Err(e) => {
                        warn!(
                            listener = listener.name(),
                            upload_id = %event.upload_id,
                            event = event.kind.name(),
                            error = %e,
                            "事件投递失败，已放弃"
                        );
                        break;
                    }
                }
            }
        }
    }
}

// ==========================================
// 通知 Trait（发后即忘）
// ==========================================

/// 导入完成通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportNotification {
    /// 固定为 price_list.imported
    pub topic: String,
    pub upload_id: String,
    pub price_list_id: String,
    pub meta: PriceListMeta,
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, notification: ImportNotification) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// 空操作通知器
#[derive(Debug, Clone, Default)]
pub struct NoOpNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for NoOpNotificationDispatcher {
    async fn notify(&self, notification: ImportNotification) -> Result<(), Box<dyn Error + Send + Sync>> {
        debug!(
            upload_id = %notification.upload_id,
            topic = %notification.topic,
            "NoOpNotificationDispatcher: 跳过通知"
        );
        Ok(())
    }
}
