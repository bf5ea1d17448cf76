//! Fan-out of pushed vendor events to the devices that own them.

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde::{Deserialize, Deserializer, Serialize},
    serde_json::Value,
    tracing::debug,
};

use crate::{state::AppState, webhook::WebhookHandler};

/// Failure while applying an update to a single device.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("device {device_id}: invalid value {value:?} for resource {resource_id}")]
    InvalidValue {
        device_id: String,
        resource_id: String,
        value: String,
    },

    #[error("device {device_id}: capability {capability} rejected update: {message}")]
    Capability {
        device_id: String,
        capability: String,
        message: String,
    },

    #[error(transparent)]
    Vendor(#[from] hublink_oauth::Error),
}

/// Body of a pushed event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMessage {
    #[serde(default)]
    pub open_id: Option<String>,
    #[serde(default)]
    pub data: Vec<ResourceRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub subject_id: String,
    pub resource_id: String,
    #[serde(deserialize_with = "string_or_scalar")]
    pub value: String,
}

impl ResourceRecord {
    pub fn new(subject_id: &str, resource_id: &str, value: &str) -> Self {
        Self {
            subject_id: subject_id.into(),
            resource_id: resource_id.into(),
            value: value.into(),
        }
    }
}

fn string_or_scalar<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        Value::Bool(b) => if b { "1" } else { "0" }.to_string(),
        other => other.to_string(),
    })
}

/// Counts from one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Delivers each message to every device whose session identity matches the
/// message `openId` and whose subject id appears in the records.
pub struct WebhookDispatcher {
    state: Arc<AppState>,
}

impl WebhookDispatcher {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn dispatch(&self, message: &WebhookMessage) -> DispatchReport {
        let mut report = DispatchReport::default();
        let Some(open_id) = message.open_id.as_deref() else {
            debug!("webhook message without openId ignored");
            return report;
        };

        for driver in self.state.drivers().await {
            for device in driver.devices() {
                if device.external_identity().as_deref() != Some(open_id) {
                    continue;
                }
                let records: Vec<ResourceRecord> = message
                    .data
                    .iter()
                    .filter(|r| r.subject_id == device.subject_id())
                    .cloned()
                    .collect();
                if records.is_empty() {
                    continue;
                }

                match device.apply_updates(&records).await {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        report.failed += 1;
                        self.state
                            .diag
                            .error(&format!("Error processing webhook message! {e}"));
                    },
                }
            }
        }
        debug!(
            open_id,
            delivered = report.delivered,
            failed = report.failed,
            "webhook message dispatched"
        );
        report
    }
}

#[async_trait]
impl WebhookHandler for WebhookDispatcher {
    async fn handle(&self, body: Value) {
        match serde_json::from_value::<WebhookMessage>(body) {
            Ok(message) => {
                self.dispatch(&message).await;
            },
            Err(e) => self
                .state
                .diag
                .error(&format!("Webhook message error: {e}")),
        }
    }
}
