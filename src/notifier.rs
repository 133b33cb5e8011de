//! Deploy notifications
//!
//! Posts a message to each configured Mattermost webhook after a successful
//! deploy. Notifications are independent and best-effort: one failure does
//! not cancel the others and never fails the cycle.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{NotificationKind, NotificationSettings};
use crate::errors::AgentError;

pub struct Notifier {
    targets: Vec<NotificationSettings>,
    client: reqwest::Client,
}

impl Notifier {
    /// Keep the enabled Mattermost entries; unknown service kinds were
    /// already warned about at configuration load.
    pub fn from_settings(
        notifications: &[NotificationSettings],
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        let targets = notifications
            .iter()
            .filter(|n| n.enabled && n.service == NotificationKind::Mattermost)
            .cloned()
            .collect();
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { targets, client })
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Post the detail to every target, logging failures.
    pub async fn notify(&self, detail: &str) {
        for target in &self.targets {
            match self.post(target, detail).await {
                Ok(()) => debug!("notification sent to {}", target.url),
                Err(e) => warn!("notification to {} failed: {}", target.url, e),
            }
        }
    }

    async fn post(&self, target: &NotificationSettings, detail: &str) -> Result<(), AgentError> {
        let mut message = if target.header_unique_name.is_empty() {
            target.message.clone()
        } else {
            format!("[{}] {}", target.header_unique_name, target.message)
        };
        if !detail.is_empty() {
            message = format!("{}\n{}", message, detail);
        }

        let body = serde_json::json!({
            "channel_id": target.channel_id,
            "message": message,
        });

        let response = self
            .client
            .post(&target.url)
            .bearer_auth(&target.personal_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Notification(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::Notification(format!(
                "{} returned {}",
                target.url,
                response.status()
            )));
        }
        Ok(())
    }
}
