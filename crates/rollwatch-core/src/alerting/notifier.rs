//! Notification delivery for alerts

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::SmtpConfig;
use crate::error::{DeliveryError, Error, Result};
use crate::models::{AlertConfig, Gauge, TransactionCondition};

use super::message;

/// A formatted alert mail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMessage {
    /// Envelope sender
    pub from_address: String,
    /// Sender name shown to recipients
    pub from_display_name: String,
    /// Recipients
    pub to: Vec<String>,
    /// Subject line
    pub subject: String,
    /// Plain text body
    pub body: String,
}

/// Hands messages to whatever actually delivers mail
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &MailMessage) -> std::result::Result<(), DeliveryError>;
}

/// Logs messages instead of sending them
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, message: &MailMessage) -> std::result::Result<(), DeliveryError> {
        info!(
            to = ?message.to,
            subject = %message.subject,
            body = %message.body,
            "No mail relay configured, logging alert notification"
        );
        Ok(())
    }
}

/// POSTs messages as JSON to an HTTP mail relay
#[derive(Debug, Clone)]
pub struct WebhookTransport {
    client: Client,
    url: String,
}

impl WebhookTransport {
    /// Transport posting to `url` with a 30 second timeout
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl MailTransport for WebhookTransport {
    async fn send(&self, message: &MailMessage) -> std::result::Result<(), DeliveryError> {
        if message.to.is_empty() {
            return Err(DeliveryError::Rejected("no recipients".to_string()));
        }

        let response = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| DeliveryError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Http(format!(
                "Mail relay returned {}: {}",
                status, body
            )));
        }

        info!(url = %self.url, subject = %message.subject, "Alert mail handed to relay");
        Ok(())
    }
}

/// Formats alert mails and sends them through a [`MailTransport`]
#[derive(Clone)]
pub struct NotificationDispatcher {
    transport: Arc<dyn MailTransport>,
    smtp: SmtpConfig,
}

impl NotificationDispatcher {
    /// Dispatcher sending through `transport`
    pub fn new(transport: Arc<dyn MailTransport>, smtp: SmtpConfig) -> Self {
        Self { transport, smtp }
    }

    /// Webhook transport when a relay is configured, logging otherwise
    pub fn from_config(smtp: &SmtpConfig) -> Result<Self> {
        let transport: Arc<dyn MailTransport> = match &smtp.relay_url {
            Some(url) => Arc::new(WebhookTransport::new(url.clone())?),
            None => Arc::new(LogTransport),
        };
        Ok(Self::new(transport, smtp.clone()))
    }

    /// Mail for a transaction alert transition
    pub fn transaction_message(
        &self,
        agent_scope: &str,
        config: &AlertConfig,
        condition: &TransactionCondition<'_>,
        observed_nanos: u64,
        transaction_count: u64,
        ok: bool,
    ) -> MailMessage {
        self.message(
            config,
            message::subject(
                &self.smtp.subject_prefix,
                agent_scope,
                condition.transaction_type,
                ok,
            ),
            message::transaction_body(
                condition.percentile,
                config.time_period_seconds,
                observed_nanos,
                transaction_count,
            ),
        )
    }

    /// Mail for a gauge alert transition
    pub fn gauge_message(
        &self,
        agent_scope: &str,
        config: &AlertConfig,
        gauge: &Gauge,
        average: f64,
        ok: bool,
    ) -> MailMessage {
        self.message(
            config,
            message::subject(&self.smtp.subject_prefix, agent_scope, &gauge.display, ok),
            message::gauge_body(config.time_period_seconds, average, gauge.unit.as_deref()),
        )
    }

    fn message(&self, config: &AlertConfig, subject: String, body: String) -> MailMessage {
        MailMessage {
            from_address: self.smtp.from_address.clone(),
            from_display_name: self.smtp.from_display_name.clone(),
            to: config.email_addresses.clone(),
            subject,
            body,
        }
    }

    /// Send, logging and counting failures
    pub async fn dispatch(&self, message: &MailMessage) -> std::result::Result<(), DeliveryError> {
        if let Err(e) = self.transport.send(message).await {
            metrics::counter!("rollwatch_notification_failures_total").increment(1);
            error!(subject = %message.subject, error = %e, "Failed to deliver alert notification");
            return Err(e);
        }
        Ok(())
    }
}
