use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use {
    futures::future::join_all,
    hublink_config::{HublinkConfig, data_dir},
    hublink_oauth::{FileStore, KeyValueStore, SessionBook, SessionRegistry},
    serde::{Deserialize, Serialize},
    tokio::sync::RwLock,
    tracing::{info, warn},
};

use crate::{
    device::{CapabilitySetter, CapabilityValue, DeviceLifecycle, DriverLifecycle, PairableDevice, ResourceDriver},
    diag::{DiagLog, DiagnosticSink},
};

/// Store key holding the list of paired devices.
pub const DEVICES_KEY: &str = "devices";

// ── Paired devices ───────────────────────────────────────────────────────────

/// A device attached to a driver during pairing, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDevice {
    pub driver_id: String,
    pub session_id: String,
    pub config_id: String,
    #[serde(flatten)]
    pub device: PairableDevice,
}

impl PairedDevice {
    /// Subject ids are only unique within one session and driver.
    pub fn same_device(&self, other: &PairedDevice) -> bool {
        self.driver_id == other.driver_id
            && self.session_id == other.session_id
            && self.device.id == other.device.id
    }
}

fn decode_paired(value: Option<serde_json::Value>) -> serde_json::Result<Vec<PairedDevice>> {
    value.map_or(Ok(Vec::new()), serde_json::from_value)
}

// ── Capability table ─────────────────────────────────────────────────────────

/// Latest value per device and capability, fed by the injected setter.
#[derive(Debug, Default)]
pub struct CapabilityTable {
    values: Mutex<BTreeMap<String, BTreeMap<String, CapabilityValue>>>,
}

impl CapabilityTable {
    pub fn get(&self, device_id: &str, capability: &str) -> Option<CapabilityValue> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(device_id)
            .and_then(|caps| caps.get(capability))
            .copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, CapabilityValue>> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn setter(self: &Arc<Self>) -> CapabilitySetter {
        let table = Arc::clone(self);
        Arc::new(move |device_id: &str, capability: &str, value: CapabilityValue| {
            info!(device = device_id, capability, %value, "capability updated");
            table
                .values
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .entry(device_id.to_string())
                .or_default()
                .insert(capability.to_string(), value);
            Ok(())
        })
    }
}

/// What [`AppState::sync_with_store`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreSync {
    pub sessions_changed: bool,
    pub released: usize,
    pub attached: usize,
    pub detached: usize,
}

// ── App state ────────────────────────────────────────────────────────────────

/// Process-wide state, created once at startup and passed by reference.
///
/// Teardown happens in the server: the webhook registration is dropped and
/// pending retry timers are cancelled before the process exits.
pub struct AppState {
    pub config: Arc<HublinkConfig>,
    pub store: Arc<dyn KeyValueStore>,
    pub registry: Arc<SessionRegistry>,
    pub diag: Arc<DiagLog>,
    pub sink: DiagnosticSink,
    pub capabilities: Arc<CapabilityTable>,
    drivers: RwLock<Vec<Arc<dyn DriverLifecycle>>>,
    /// Backing file when the state was opened over a [`FileStore`].
    pub store_path: Option<PathBuf>,
    pub version: String,
}

impl AppState {
    pub fn new(
        config: HublinkConfig,
        store: Arc<dyn KeyValueStore>,
    ) -> hublink_oauth::Result<Arc<Self>> {
        Self::build(config, store, None)
    }

    fn build(
        config: HublinkConfig,
        store: Arc<dyn KeyValueStore>,
        store_path: Option<PathBuf>,
    ) -> hublink_oauth::Result<Arc<Self>> {
        let config = Arc::new(config);
        let sessions = Arc::new(SessionBook::new(Arc::clone(&store)));
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&config), sessions)?);
        let sink = DiagnosticSink::new(reqwest::Client::new(), config.diagnostics.sink_url.clone());

        Ok(Arc::new(Self {
            diag: Arc::new(DiagLog::new(&config.diagnostics)),
            config,
            store,
            registry,
            sink,
            capabilities: Arc::new(CapabilityTable::default()),
            drivers: RwLock::new(Vec::new()),
            store_path,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    /// State backed by the JSON store at `store_path` (default
    /// `~/.hublink/store.json`).
    pub fn open(config: HublinkConfig) -> anyhow::Result<Arc<Self>> {
        let path = config
            .store_path
            .clone()
            .unwrap_or_else(|| data_dir().join("store.json"));
        info!(path = %path.display(), "opening store");
        let store = Arc::new(FileStore::new(path.clone()));
        Ok(Self::build(config, store, Some(path))?)
    }

    pub fn sessions(&self) -> &Arc<SessionBook> {
        self.registry.session_book()
    }

    pub async fn add_driver(&self, driver: Arc<dyn DriverLifecycle>) {
        self.drivers.write().await.push(driver);
    }

    pub async fn drivers(&self) -> Vec<Arc<dyn DriverLifecycle>> {
        self.drivers.read().await.clone()
    }

    pub async fn driver(&self, id: &str) -> Option<Arc<dyn DriverLifecycle>> {
        self.drivers
            .read()
            .await
            .iter()
            .find(|d| d.id() == id)
            .cloned()
    }

    /// Create a resource driver for every configured driver.
    pub async fn install_config_drivers(&self) {
        let setter = self.capabilities.setter();
        for config in self.config.effective_drivers() {
            let driver = Arc::new(ResourceDriver::new(config, Arc::clone(&setter)));
            if let Err(e) = driver.on_init().await {
                self.diag.error(&format!("driver {} failed to start: {e}", driver.id()));
                continue;
            }
            self.add_driver(driver).await;
        }
    }

    /// Persisted paired devices. Unreadable data reads as empty.
    pub fn paired_devices(&self) -> Vec<PairedDevice> {
        let value = match self.store.get(DEVICES_KEY) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to read paired devices");
                return Vec::new();
            },
        };
        decode_paired(value).unwrap_or_else(|e| {
            warn!(error = %e, "paired devices record is malformed");
            Vec::new()
        })
    }

    /// Add or replace entries, keyed by driver, session and device id.
    pub fn record_paired(&self, entries: &[PairedDevice]) -> hublink_oauth::Result<()> {
        self.update_paired(|devices| {
            for entry in entries {
                devices.retain(|d| !d.same_device(entry));
                devices.push(entry.clone());
            }
            true
        })
    }

    /// Drop every paired device owned by a session. Returns how many went.
    pub fn forget_session_devices(&self, session_id: &str) -> hublink_oauth::Result<usize> {
        let mut removed = 0;
        self.update_paired(|devices| {
            let before = devices.len();
            devices.retain(|d| d.session_id != session_id);
            removed = before - devices.len();
            removed > 0
        })?;
        Ok(removed)
    }

    /// Read-modify-write of the device list under the store's lock. `apply`
    /// returns whether it changed anything.
    fn update_paired(
        &self,
        mut apply: impl FnMut(&mut Vec<PairedDevice>) -> bool,
    ) -> hublink_oauth::Result<()> {
        self.store.update(DEVICES_KEY, &mut |value| {
            let mut devices = decode_paired(value).unwrap_or_else(|e| {
                warn!(error = %e, "replacing malformed paired devices record");
                Vec::new()
            });
            if !apply(&mut devices) {
                return Ok(None);
            }
            serde_json::to_value(&devices)
                .map(Some)
                .map_err(|e| hublink_oauth::Error::Store(format!("encode paired devices: {e}")))
        })
    }

    /// Reattach persisted devices to their drivers and run their init hooks.
    /// Devices whose session or driver is gone are skipped.
    pub async fn restore_devices(&self) -> usize {
        self.attach_devices(|_| true, false).await
    }

    /// Run the init hooks of every device paired through `session_id` again,
    /// attaching any that are not attached yet. Used after re-authorization.
    pub async fn reinit_session_devices(&self, session_id: &str) -> usize {
        self.attach_devices(|d| d.session_id == session_id, true)
            .await
    }

    /// Attach the persisted devices matching `filter` and initialize them.
    /// Devices already attached are only initialized again when `reinit` is
    /// set. Returns how many devices were initialized.
    async fn attach_devices(&self, filter: impl Fn(&PairedDevice) -> bool, reinit: bool) -> usize {
        let mut pending: Vec<Arc<dyn DeviceLifecycle>> = Vec::new();
        for paired in self.paired_devices().into_iter().filter(|d| filter(d)) {
            let client = match self.registry.get_client(&paired.session_id, &paired.config_id) {
                Ok(client) => client,
                Err(e) => {
                    warn!(device = %paired.device.id, error = %e, "paired device has no session");
                    continue;
                },
            };
            let Some(driver) = self.driver(&paired.driver_id).await else {
                warn!(device = %paired.device.id, driver = %paired.driver_id, "paired device has no driver");
                continue;
            };
            let attached = driver.devices().iter().any(|d| {
                d.session_id() == paired.session_id && d.subject_id() == paired.device.id
            });
            let device = driver.add_device(client, &paired.device);
            if reinit || !attached {
                pending.push(device);
            }
        }

        let results = join_all(pending.iter().map(|device| device.on_init())).await;
        for (device, result) in pending.iter().zip(results) {
            if let Err(e) = result {
                self.diag
                    .error(&format!("device {} failed to initialize: {e}", device.subject_id()));
            }
        }
        pending.len()
    }

    /// Detach attached devices that are no longer persisted or whose session
    /// is no longer live. Returns how many went.
    async fn detach_stale_devices(&self) -> usize {
        let paired = self.paired_devices();
        let mut detached = 0;
        for driver in self.drivers().await {
            for device in driver.devices() {
                let still_paired = paired.iter().any(|p| {
                    p.driver_id == driver.id()
                        && p.session_id == device.session_id()
                        && p.device.id == device.subject_id()
                });
                let live = self.registry.find_session(device.session_id()).is_some();
                if still_paired && live {
                    continue;
                }
                if let Some(removed) = driver.remove_device(device.session_id(), device.subject_id())
                {
                    removed.on_deleted().await;
                    detached += 1;
                }
            }
        }
        detached
    }

    /// Follow changes another process made to the store: reload the session
    /// set (which wakes the webhook registrar), restore or release clients
    /// and attach or detach devices to match.
    pub async fn sync_with_store(&self) -> StoreSync {
        let sessions_changed = self.sessions().reload();
        self.registry.restore();
        let released = self.registry.release_unsaved();
        let detached = self.detach_stale_devices().await;
        let attached = self.attach_devices(|_| true, false).await;

        let sync = StoreSync {
            sessions_changed,
            released: released.len(),
            attached,
            detached,
        };
        if sync != StoreSync::default() {
            info!(
                sessions_changed,
                released = sync.released,
                attached,
                detached,
                "applied store changes"
            );
        }
        sync
    }
}
