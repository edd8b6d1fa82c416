pub mod audit;
pub mod conditions;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod notify;
pub mod scheduler;
pub mod selector;
pub mod store;
pub mod validation;

pub use audit::{AuditAction, AuditEntry, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use domain::approval::{
    ApprovalId, ApprovalRecord, ApprovalRequest, ApprovalStatus, Decision, Delegation, Escalation,
};
pub use domain::document::{Document, DocumentId};
pub use domain::workflow::{
    CompletionRule, Condition, EscalationAction, EscalationPolicy, Step, WorkflowId,
    WorkflowTemplate,
};
pub use engine::{
    ActOutcome, ApprovalEngine, EngineOptions, QuorumCounting, TimeoutOutcome, SYSTEM_ACTOR,
};
pub use errors::EngineError;
pub use notify::{
    InMemoryNotificationSink, Notification, NotificationKind, NotificationSink,
    TracingNotificationSink,
};
pub use scheduler::{ScanReport, TimeoutScheduler};
pub use selector::WorkflowSelector;
pub use store::{ApprovalStore, InMemoryStore, StoreError, WorkflowStore};
pub use validation::validate_template;
