//! The persisted session set.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use {
    serde::{Deserialize, Serialize},
    tokio::sync::watch,
    tracing::{debug, warn},
};

use crate::{
    error::{Error, Result},
    store::KeyValueStore,
    token::OAuth2Token,
};

/// Store key holding the `session id -> SavedSession` map.
pub const SESSIONS_KEY: &str = "oauth2_sessions";

/// Persisted metadata for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSession {
    #[serde(rename = "configId")]
    pub config_id: String,
    #[serde(default)]
    pub token: OAuth2Token,
    #[serde(default)]
    pub title: Option<String>,
}

pub type SessionSet = BTreeMap<String, SavedSession>;

/// Owner of the persisted session set.
///
/// Every change bumps a generation counter observable through
/// [`SessionBook::subscribe`]. Changes written by another process over the
/// same store are picked up by [`SessionBook::reload`].
pub struct SessionBook {
    store: Arc<dyn KeyValueStore>,
    last_seen: Mutex<Option<SessionSet>>,
    changes: watch::Sender<u64>,
}

impl SessionBook {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            store,
            last_seen: Mutex::new(None),
            changes,
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Snapshot of the saved sessions. Never fails: unreadable storage is
    /// logged and treated as empty.
    pub fn saved_sessions(&self) -> SessionSet {
        match self.read() {
            Ok(set) => set,
            Err(e) => {
                warn!(error = %e, "failed to read saved sessions");
                SessionSet::new()
            },
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.saved_sessions().contains_key(session_id)
    }

    /// Distinct external identities across all saved sessions.
    pub fn external_identities(&self) -> BTreeSet<String> {
        self.saved_sessions()
            .into_values()
            .filter_map(|s| s.token.external_identity().map(str::to_string))
            .collect()
    }

    pub fn upsert(&self, session_id: &str, session: SavedSession) -> Result<()> {
        let mut written = None;
        self.store.update(SESSIONS_KEY, &mut |value| {
            let mut set = decode(value)?;
            if set.get(session_id) == Some(&session) {
                return Ok(None);
            }
            set.insert(session_id.to_string(), session.clone());
            let encoded = encode(&set)?;
            written = Some(set);
            Ok(Some(encoded))
        })?;
        if let Some(set) = written {
            debug!(session_id, "saved session");
            self.observe(set);
        }
        Ok(())
    }

    pub fn remove(&self, session_id: &str) -> Result<Option<SavedSession>> {
        let mut removed = None;
        let mut written = None;
        self.store.update(SESSIONS_KEY, &mut |value| {
            let mut set = decode(value)?;
            removed = set.remove(session_id);
            if removed.is_none() {
                return Ok(None);
            }
            let encoded = encode(&set)?;
            written = Some(set);
            Ok(Some(encoded))
        })?;
        if let Some(set) = written {
            debug!(session_id, "removed session");
            self.observe(set);
        }
        Ok(removed)
    }

    /// Re-read the store and announce a change when the session set differs
    /// from the last one this book saw. Returns whether it changed.
    pub fn reload(&self) -> bool {
        let set = match self.read() {
            Ok(set) => set,
            Err(e) => {
                // A torn or unreadable file is not an empty session set.
                warn!(error = %e, "failed to reload saved sessions");
                return false;
            },
        };
        let changed = self.observe(set);
        if changed {
            debug!("saved sessions changed outside this process");
        }
        changed
    }

    /// Receiver that changes whenever the session set is written.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Remember `set` as current and bump the generation if it is new.
    fn observe(&self, set: SessionSet) -> bool {
        {
            let mut last = self.last_seen.lock().unwrap_or_else(|p| p.into_inner());
            if last.as_ref() == Some(&set) {
                return false;
            }
            *last = Some(set);
        }
        self.changes.send_modify(|generation| *generation += 1);
        true
    }

    fn read(&self) -> Result<SessionSet> {
        decode(self.store.get(SESSIONS_KEY)?)
    }
}

fn decode(value: Option<serde_json::Value>) -> Result<SessionSet> {
    match value {
        Some(value) => serde_json::from_value(value).map_err(|e| Error::parse("saved sessions", e)),
        None => Ok(SessionSet::new()),
    }
}

fn encode(set: &SessionSet) -> Result<serde_json::Value> {
    serde_json::to_value(set).map_err(|e| Error::parse("saved sessions", e))
}
