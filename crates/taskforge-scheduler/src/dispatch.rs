//! Notification dispatch: concrete delivery targets for task events.
//! Supports: tracing log lines and generic HTTP webhooks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskforge_core::config::NotifyConfig;
use taskforge_core::error::{Result, TaskForgeError};
use taskforge_core::traits::NotificationDispatcher;
use taskforge_core::types::{TaskEvent, TaskEventKind};

/// Writes every event to the log.
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &TaskEvent) -> Result<()> {
        let phase = event
            .phase
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".into());
        match event.kind {
            TaskEventKind::Terminal => tracing::info!(
                "📢 [{}] {} ({}): {}",
                event.task_id,
                event.status,
                phase,
                event.summary
            ),
            _ => tracing::debug!(
                "📢 [{}] {} ({}): {}",
                event.task_id,
                event.status,
                phase,
                event.summary
            ),
        }
        Ok(())
    }
}

/// Generic HTTP webhook: POST with the event as JSON body.
pub struct WebhookDispatcher {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(url: impl Into<String>, headers: Vec<(String, String)>) -> Self {
        Self {
            url: url.into(),
            headers,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, event: &TaskEvent) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "task_id": event.task_id,
                "kind": event.kind,
                "status": event.status,
                "phase": event.phase,
                "summary": event.summary,
                "timestamp": event.timestamp.to_rfc3339(),
            }))
            .timeout(Duration::from_secs(10));

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TaskForgeError::Notify(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::debug!("✅ Webhook notification sent to {}: {}", self.url, event.task_id);
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(TaskForgeError::Notify(format!("Webhook error {status}: {body}")))
        }
    }
}

/// Build the dispatchers enabled by `[notify]`.
pub fn dispatchers_from_config(config: &NotifyConfig) -> Vec<Arc<dyn NotificationDispatcher>> {
    let mut dispatchers: Vec<Arc<dyn NotificationDispatcher>> = Vec::new();
    if config.log_events {
        dispatchers.push(Arc::new(LogDispatcher));
    }
    if let Some(url) = config.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        dispatchers.push(Arc::new(WebhookDispatcher::new(
            url,
            config.webhook_headers.clone(),
        )));
    }
    dispatchers
}
