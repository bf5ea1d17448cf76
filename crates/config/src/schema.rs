/// Config schema types (regions, webhook, listener, diagnostics, drivers).
use std::{collections::HashMap, path::PathBuf};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, Serializer},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HublinkConfig {
    /// Per-region overrides keyed by config id ("europe", "china", ...).
    /// Unset fields fall back to the built-in region table.
    pub regions: HashMap<String, RegionConfig>,
    pub webhook: WebhookConfig,
    pub listener: ListenerConfig,
    pub diagnostics: DiagnosticsConfig,
    pub drivers: Vec<DriverConfig>,
    /// JSON key-value store holding sessions and paired devices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

/// Credentials and endpoints for one vendor region.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub app_id: Option<String>,
    #[serde(serialize_with = "serialize_option_secret")]
    pub app_key: Option<Secret<String>>,
    pub key_id: Option<String>,
    pub api_url: Option<String>,
    pub token_url: Option<String>,
    pub authorization_url: Option<String>,
    pub redirect_url: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub lang: Option<String>,
}

impl RegionConfig {
    /// Fill every unset field from `base`.
    pub fn layered_over(self, base: RegionConfig) -> RegionConfig {
        RegionConfig {
            app_id: self.app_id.or(base.app_id),
            app_key: self.app_key.or(base.app_key),
            key_id: self.key_id.or(base.key_id),
            api_url: self.api_url.or(base.api_url),
            token_url: self.token_url.or(base.token_url),
            authorization_url: self.authorization_url.or(base.authorization_url),
            redirect_url: self.redirect_url.or(base.redirect_url),
            scopes: self.scopes.or(base.scopes),
            lang: self.lang.or(base.lang),
        }
    }
}

/// Cloud push-notification registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub id: Option<String>,
    #[serde(serialize_with = "serialize_option_secret")]
    pub secret: Option<Secret<String>>,
    /// Delay before retrying a failed or skipped registration.
    pub retry_delay_ms: u64,
    pub bind: String,
    pub port: u16,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            id: None,
            secret: None,
            retry_delay_ms: 2_000,
            bind: "0.0.0.0".into(),
            port: 18790,
        }
    }
}

/// Raw diagnostic listener that relays bodies to the diagnostic sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub enabled: bool,
    pub port: u16,
    pub retry_delay_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 5555,
            retry_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Record info-level entries too (errors are always recorded).
    pub log_enabled: bool,
    /// External endpoint receiving raw listener bodies.
    pub sink_url: Option<String>,
    /// Rolling log capacity in characters.
    pub max_len: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            log_enabled: false,
            sink_url: None,
            max_len: 60_000,
        }
    }
}

/// A config-driven driver: which device models it pairs and how vendor
/// resources map onto capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub resources: Vec<ResourceMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMapping {
    pub resource_id: String,
    pub capability: String,
    pub kind: ResourceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Number,
    Boolean,
}

impl DriverConfig {
    /// Presence/motion sensor with an illuminance channel.
    pub fn motion_sensor() -> Self {
        Self {
            id: "motion".into(),
            name: "Motion and light sensor".into(),
            models: vec!["lumi.motion.agl001".into()],
            resources: vec![
                ResourceMapping {
                    resource_id: "0.4.85".into(),
                    capability: "measure_luminance".into(),
                    kind: ResourceKind::Number,
                },
                ResourceMapping {
                    resource_id: "3.51.85".into(),
                    capability: "alarm_motion".into(),
                    kind: ResourceKind::Boolean,
                },
            ],
        }
    }
}

impl HublinkConfig {
    /// Configured drivers, or the built-in motion sensor driver when none are set.
    pub fn effective_drivers(&self) -> Vec<DriverConfig> {
        if self.drivers.is_empty() {
            vec![DriverConfig::motion_sensor()]
        } else {
            self.drivers.clone()
        }
    }
}

pub fn serialize_option_secret<S: Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}
