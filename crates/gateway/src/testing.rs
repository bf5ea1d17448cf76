//! Fixtures shared by the gateway unit tests.

use std::sync::{Arc, Mutex};

use {
    hublink_config::{DiagnosticsConfig, HublinkConfig, RegionConfig},
    hublink_oauth::{MemoryStore, OAuth2Client, OAuth2Token, SessionBook},
    secrecy::Secret,
};

use crate::{
    device::{CapabilitySetter, CapabilityValue},
    diag::DiagLog,
    state::AppState,
};

pub(crate) fn region_id() -> &'static str {
    "test"
}

pub(crate) fn region(url: &str) -> RegionConfig {
    RegionConfig {
        app_id: Some("app-1".into()),
        app_key: Some(Secret::new("key-1".into())),
        key_id: Some("K.1".into()),
        api_url: Some(format!("{url}/api")),
        token_url: Some(format!("{url}/access_token")),
        authorization_url: Some(format!("{url}/authorize")),
        redirect_url: Some("https://example.com/callback".into()),
        scopes: None,
        lang: None,
    }
}

/// Config with the `test` region pointed at `url`.
pub(crate) fn config(url: &str) -> HublinkConfig {
    let mut config = HublinkConfig::default();
    config.regions.insert(region_id().into(), region(url));
    config.diagnostics.log_enabled = true;
    config
}

/// Authorized client with its own in-memory session book.
pub(crate) fn client(url: &str, session_id: &str, open_id: &str) -> Arc<OAuth2Client> {
    let book = Arc::new(SessionBook::new(Arc::new(MemoryStore::new())));
    let client = Arc::new(OAuth2Client::new(
        session_id,
        region_id(),
        region(url),
        reqwest::Client::new(),
        book,
    ));
    client.set_token(OAuth2Token::new(
        Some("T".into()),
        None,
        None,
        None,
        Some(open_id.into()),
    ));
    client
}

pub(crate) fn diag_log() -> Arc<DiagLog> {
    Arc::new(DiagLog::new(&DiagnosticsConfig {
        log_enabled: true,
        sink_url: None,
        max_len: 60_000,
    }))
}

pub(crate) fn app_state() -> Arc<AppState> {
    app_state_for("http://127.0.0.1:1")
}

pub(crate) fn app_state_for(url: &str) -> Arc<AppState> {
    #[allow(clippy::unwrap_used)]
    AppState::new(config(url), Arc::new(MemoryStore::new())).unwrap()
}

/// Setter that records every call.
#[derive(Clone, Default)]
pub(crate) struct RecordingSetter {
    values: Arc<Mutex<Vec<(String, String, CapabilityValue)>>>,
}

impl RecordingSetter {
    pub(crate) fn setter(&self) -> CapabilitySetter {
        let values = Arc::clone(&self.values);
        Arc::new(move |device: &str, capability: &str, value: CapabilityValue| {
            values
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push((device.into(), capability.into(), value));
            Ok(())
        })
    }

    pub(crate) fn values(&self) -> Vec<(String, String, CapabilityValue)> {
        self.values
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}
