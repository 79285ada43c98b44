// ==========================================
// 价目表导入系统 - 引擎层
// ==========================================
// 职责: 定价规则、上传编排、事件发布
// 红线: Engine 不拼 SQL，外部读写全部经协作方 Trait
// ==========================================

pub mod collaborators;
pub mod events;
pub mod orchestrator;
pub mod price_rules;

// 重导出核心引擎
pub use collaborators::UploadCollaborators;
pub use events::{
    ChannelEventListener, EventBus, ImportNotification, NoOpEventListener,
    NoOpNotificationDispatcher, NotificationDispatcher, UploadEvent, UploadEventKind,
    UploadEventListener,
};
pub use orchestrator::{UploadOrchestrator, IMPORTED_TOPIC};
pub use price_rules::{PriceRulesEngine, MANUAL_OVERRIDE_RULE};
