//! Device and driver capability interfaces, plus the config-driven resource
//! driver that maps vendor resource ids onto capabilities.

use std::sync::{Arc, Mutex, MutexGuard};

use {
    async_trait::async_trait,
    hublink_config::{DriverConfig, ResourceKind, ResourceMapping},
    hublink_oauth::OAuth2Client,
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::dispatch::{DispatchError, ResourceRecord};

// ── Capability values ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Number(i64),
    Boolean(bool),
}

impl std::fmt::Display for CapabilityValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// Host callback that applies `(device id, capability, value)`.
pub type CapabilitySetter =
    Arc<dyn Fn(&str, &str, CapabilityValue) -> Result<(), String> + Send + Sync>;

/// Parse a raw vendor value. Numbers keep their integer part; booleans are
/// `"1"` for true.
pub fn parse_value(kind: ResourceKind, raw: &str) -> Option<CapabilityValue> {
    let raw = raw.trim();
    match kind {
        ResourceKind::Number => raw
            .parse::<i64>()
            .ok()
            .or_else(|| raw.parse::<f64>().ok().map(|f| f.trunc() as i64))
            .map(CapabilityValue::Number),
        ResourceKind::Boolean => Some(CapabilityValue::Boolean(raw == "1")),
    }
}

// ── Lifecycle traits ─────────────────────────────────────────────────────────

/// A device offered during pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairableDevice {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub model: String,
}

#[async_trait]
pub trait DeviceLifecycle: Send + Sync {
    /// Vendor subject id.
    fn subject_id(&self) -> &str;

    /// Session that owns this device. Subject ids are only unique per
    /// session.
    fn session_id(&self) -> &str;

    fn name(&self) -> &str;

    /// Identity of the session that owns this device.
    fn external_identity(&self) -> Option<String>;

    async fn on_init(&self) -> Result<(), DispatchError>;

    /// Apply pushed records, in order. Records are already filtered to this
    /// device.
    async fn apply_updates(&self, records: &[ResourceRecord]) -> Result<(), DispatchError>;

    async fn on_deleted(&self) {}
}

#[async_trait]
pub trait DriverLifecycle: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    async fn on_init(&self) -> Result<(), DispatchError> {
        Ok(())
    }

    /// Devices on the account this driver can pair.
    async fn on_pair_list_devices(
        &self,
        client: &OAuth2Client,
    ) -> hublink_oauth::Result<Vec<PairableDevice>>;

    /// Attach a device. Adding a subject id the client's session already
    /// owns returns the existing device.
    fn add_device(
        &self,
        client: Arc<OAuth2Client>,
        device: &PairableDevice,
    ) -> Arc<dyn DeviceLifecycle>;

    fn remove_device(&self, session_id: &str, subject_id: &str)
    -> Option<Arc<dyn DeviceLifecycle>>;

    fn devices(&self) -> Vec<Arc<dyn DeviceLifecycle>>;
}

// ── Resource device ──────────────────────────────────────────────────────────

pub struct ResourceDevice {
    subject_id: String,
    name: String,
    resources: Vec<ResourceMapping>,
    client: Arc<OAuth2Client>,
    set_capability: CapabilitySetter,
}

impl ResourceDevice {
    pub fn new(
        device: &PairableDevice,
        resources: Vec<ResourceMapping>,
        client: Arc<OAuth2Client>,
        set_capability: CapabilitySetter,
    ) -> Self {
        Self {
            subject_id: device.id.clone(),
            name: device.name.clone(),
            resources,
            client,
            set_capability,
        }
    }

    pub fn client(&self) -> &Arc<OAuth2Client> {
        &self.client
    }

    fn resource_ids(&self) -> Vec<String> {
        self.resources
            .iter()
            .map(|r| r.resource_id.clone())
            .collect()
    }

    fn apply_value(&self, resource_id: &str, raw: &str) -> Result<(), DispatchError> {
        let Some(mapping) = self.resources.iter().find(|r| r.resource_id == resource_id) else {
            debug!(device = %self.subject_id, resource_id, "unmapped resource");
            return Ok(());
        };
        let value = parse_value(mapping.kind, raw).ok_or_else(|| DispatchError::InvalidValue {
            device_id: self.subject_id.clone(),
            resource_id: resource_id.into(),
            value: raw.into(),
        })?;
        (self.set_capability)(&self.subject_id, &mapping.capability, value).map_err(|message| {
            DispatchError::Capability {
                device_id: self.subject_id.clone(),
                capability: mapping.capability.clone(),
                message,
            }
        })
    }
}

impl std::fmt::Debug for ResourceDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDevice")
            .field("subject_id", &self.subject_id)
            .field("name", &self.name)
            .field("session_id", &self.client.session_id())
            .finish()
    }
}

#[async_trait]
impl DeviceLifecycle for ResourceDevice {
    fn subject_id(&self) -> &str {
        &self.subject_id
    }

    fn session_id(&self) -> &str {
        self.client.session_id()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn external_identity(&self) -> Option<String> {
        self.client.external_identity()
    }

    /// Read current values, then subscribe. An offline device stops here.
    async fn on_init(&self) -> Result<(), DispatchError> {
        let ids = self.resource_ids();
        let Some(values) = self
            .client
            .query_resource_values(&self.subject_id, &ids)
            .await?
        else {
            debug!(device = %self.subject_id, "device offline, skipping subscribe");
            return Ok(());
        };
        for value in values {
            if let Err(e) = self.apply_value(&value.resource_id, &value.value) {
                warn!(error = %e, "initial value rejected");
            }
        }

        let subscribed = self
            .client
            .subscribe_resources(&self.subject_id, &ids)
            .await?;
        debug!(device = %self.subject_id, subscribed, "resource subscription");
        Ok(())
    }

    async fn apply_updates(&self, records: &[ResourceRecord]) -> Result<(), DispatchError> {
        let mut first_error = None;
        for record in records {
            if let Err(e) = self.apply_value(&record.resource_id, &record.value) {
                warn!(error = %e, "update rejected");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

// ── Resource driver ──────────────────────────────────────────────────────────

pub struct ResourceDriver {
    config: DriverConfig,
    set_capability: CapabilitySetter,
    devices: Mutex<Vec<Arc<ResourceDevice>>>,
}

impl ResourceDriver {
    pub fn new(config: DriverConfig, set_capability: CapabilitySetter) -> Self {
        Self {
            config,
            set_capability,
            devices: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<ResourceDevice>>> {
        self.devices.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl DriverLifecycle for ResourceDriver {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn on_pair_list_devices(
        &self,
        client: &OAuth2Client,
    ) -> hublink_oauth::Result<Vec<PairableDevice>> {
        let devices = client.list_devices().await?;
        Ok(devices
            .into_iter()
            .filter(|d| self.config.models.iter().any(|m| *m == d.model))
            .map(|d| PairableDevice {
                name: if d.device_name.is_empty() {
                    d.did.clone()
                } else {
                    d.device_name
                },
                id: d.did,
                model: d.model,
            })
            .collect())
    }

    fn add_device(
        &self,
        client: Arc<OAuth2Client>,
        device: &PairableDevice,
    ) -> Arc<dyn DeviceLifecycle> {
        let mut devices = self.lock();
        if let Some(existing) = devices
            .iter()
            .find(|d| d.subject_id == device.id && d.session_id() == client.session_id())
        {
            return Arc::clone(existing) as Arc<dyn DeviceLifecycle>;
        }
        let added = Arc::new(ResourceDevice::new(
            device,
            self.config.resources.clone(),
            client,
            Arc::clone(&self.set_capability),
        ));
        devices.push(Arc::clone(&added));
        added
    }

    fn remove_device(
        &self,
        session_id: &str,
        subject_id: &str,
    ) -> Option<Arc<dyn DeviceLifecycle>> {
        let mut devices = self.lock();
        let index = devices
            .iter()
            .position(|d| d.subject_id == subject_id && d.session_id() == session_id)?;
        Some(devices.remove(index) as Arc<dyn DeviceLifecycle>)
    }

    fn devices(&self) -> Vec<Arc<dyn DeviceLifecycle>> {
        self.lock()
            .iter()
            .map(|d| Arc::clone(d) as Arc<dyn DeviceLifecycle>)
            .collect()
    }
}
