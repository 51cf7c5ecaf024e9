//! Threshold alerting over rolled-up data
//!
//! Each alert config is evaluated against the rollup level that fits its
//! window. Triggered state is keyed by config version, so editing a config
//! starts it from scratch.

mod evaluator;
mod message;
mod notifier;
mod repository;

pub use evaluator::{AlertEvaluator, AlertOutcome, AlertPassSummary};
pub use message::percentile_with_suffix;
pub use notifier::{
    LogTransport, MailMessage, MailTransport, NotificationDispatcher, WebhookTransport,
};
pub use repository::AlertRepository;
