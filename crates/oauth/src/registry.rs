//! Live clients keyed by `(session id, config id)`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use {
    hublink_config::{HublinkConfig, resolve_region},
    tracing::{info, warn},
};

use crate::{
    client::OAuth2Client,
    error::{Error, Result},
    sessions::{SessionBook, SessionSet},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub session_id: String,
    pub config_id: String,
}

impl SessionKey {
    pub fn new(session_id: &str, config_id: &str) -> Self {
        Self {
            session_id: session_id.into(),
            config_id: config_id.into(),
        }
    }
}

pub struct SessionRegistry {
    config: Arc<HublinkConfig>,
    sessions: Arc<SessionBook>,
    http: reqwest::Client,
    clients: Mutex<HashMap<SessionKey, Arc<OAuth2Client>>>,
}

impl SessionRegistry {
    pub fn new(config: Arc<HublinkConfig>, sessions: Arc<SessionBook>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_http(config, sessions, http))
    }

    pub fn with_http(
        config: Arc<HublinkConfig>,
        sessions: Arc<SessionBook>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            sessions,
            http,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionKey, Arc<OAuth2Client>>> {
        self.clients.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn session_book(&self) -> &Arc<SessionBook> {
        &self.sessions
    }

    pub fn config(&self) -> &Arc<HublinkConfig> {
        &self.config
    }

    /// Persisted sessions. An unreadable store reads as empty.
    pub fn saved_sessions(&self) -> SessionSet {
        self.sessions.saved_sessions()
    }

    /// Register a new client. Fails when the key is already taken or the
    /// region is unknown.
    pub fn create_client(&self, session_id: &str, config_id: &str) -> Result<Arc<OAuth2Client>> {
        let region = resolve_region(&self.config, config_id)
            .ok_or_else(|| Error::Config(format!("unknown region {config_id}")))?;

        let key = SessionKey::new(session_id, config_id);
        let mut clients = self.lock();
        if clients.contains_key(&key) {
            return Err(Error::AlreadyExists {
                session_id: key.session_id,
                config_id: key.config_id,
            });
        }
        let client = Arc::new(OAuth2Client::new(
            session_id,
            config_id,
            region,
            self.http.clone(),
            Arc::clone(&self.sessions),
        ));
        clients.insert(key, Arc::clone(&client));
        Ok(client)
    }

    pub fn get_client(&self, session_id: &str, config_id: &str) -> Result<Arc<OAuth2Client>> {
        self.lock()
            .get(&SessionKey::new(session_id, config_id))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                session_id: session_id.into(),
                config_id: config_id.into(),
            })
    }

    /// Every live client, in no particular order.
    pub fn clients(&self) -> Vec<Arc<OAuth2Client>> {
        self.lock().values().cloned().collect()
    }

    /// Find the live client for a session id regardless of region.
    pub fn find_session(&self, session_id: &str) -> Option<Arc<OAuth2Client>> {
        self.lock()
            .iter()
            .find(|(key, _)| key.session_id == session_id)
            .map(|(_, client)| Arc::clone(client))
    }

    /// Drop a client from the registry without touching persisted state.
    pub fn release_client(&self, session_id: &str, config_id: &str) -> Option<Arc<OAuth2Client>> {
        self.lock().remove(&SessionKey::new(session_id, config_id))
    }

    /// Drop live clients whose session is no longer saved, as happens when
    /// another process logs a session out. Returns the released clients.
    pub fn release_unsaved(&self) -> Vec<Arc<OAuth2Client>> {
        let saved = self.saved_sessions();
        let mut clients = self.lock();
        let stale: Vec<SessionKey> = clients
            .keys()
            .filter(|key| {
                saved
                    .get(&key.session_id)
                    .is_none_or(|s| s.config_id != key.config_id)
            })
            .cloned()
            .collect();
        let released: Vec<Arc<OAuth2Client>> =
            stale.iter().filter_map(|key| clients.remove(key)).collect();
        for client in &released {
            info!(session_id = client.session_id(), "released client for a removed session");
        }
        released
    }

    /// Destroy a client and forget its persisted session. Subscribers see
    /// `Destroyed` while the client is still registered.
    pub fn destroy_client(&self, session_id: &str, config_id: &str) -> Result<()> {
        let client = self.get_client(session_id, config_id)?;
        let result = client.destroy();
        self.release_client(session_id, config_id);
        result
    }

    /// Recreate a client for every saved session. Sessions whose region is no
    /// longer known are skipped.
    pub fn restore(&self) -> Vec<Arc<OAuth2Client>> {
        let mut restored = Vec::new();
        for (session_id, saved) in self.saved_sessions() {
            let client = match self.get_client(&session_id, &saved.config_id) {
                Ok(existing) => existing,
                Err(_) => match self.create_client(&session_id, &saved.config_id) {
                    Ok(client) => client,
                    Err(e) => {
                        warn!(session_id, config_id = %saved.config_id, error = %e, "skipping saved session");
                        continue;
                    },
                },
            };
            client.set_title(saved.title);
            client.set_token(saved.token);
            restored.push(client);
        }
        info!(count = restored.len(), "restored saved sessions");
        restored
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{client::ClientState, store::MemoryStore, token::OAuth2Token},
        hublink_config::RegionConfig,
        mockito::Server,
        secrecy::Secret,
    };

    fn config(server_url: &str) -> Arc<HublinkConfig> {
        let mut config = HublinkConfig::default();
        config.regions.insert("test".into(), RegionConfig {
            app_id: Some("app-1".into()),
            app_key: Some(Secret::new("key-1".into())),
            key_id: Some("K.1".into()),
            api_url: Some(format!("{server_url}/api")),
            token_url: Some(format!("{server_url}/access_token")),
            authorization_url: Some(format!("{server_url}/authorize")),
            redirect_url: Some("https://example.com/callback".into()),
            scopes: None,
            lang: None,
        });
        Arc::new(config)
    }

    fn registry(server_url: &str) -> SessionRegistry {
        let book = Arc::new(SessionBook::new(Arc::new(MemoryStore::new())));
        SessionRegistry::with_http(config(server_url), book, reqwest::Client::new())
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let registry = registry("http://127.0.0.1:1");
        registry.create_client("s1", "test").unwrap();
        assert!(matches!(
            registry.create_client("s1", "test"),
            Err(Error::AlreadyExists { .. })
        ));
        // Same session id under a different region is a different key.
        registry.create_client("s1", "europe").unwrap();
    }

    #[test]
    fn missing_client_is_not_found() {
        let registry = registry("http://127.0.0.1:1");
        assert!(matches!(
            registry.get_client("nope", "test"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn unknown_region_is_config_error() {
        let registry = registry("http://127.0.0.1:1");
        assert!(matches!(
            registry.create_client("s1", "atlantis"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn restore_rebuilds_saved_clients() {
        let registry = registry("http://127.0.0.1:1");
        let client = registry.create_client("s1", "test").unwrap();
        client.set_token(OAuth2Token::new(
            Some("T".into()),
            Some("R".into()),
            None,
            None,
            Some("U1".into()),
        ));
        client.set_title(Some("Home".into()));
        client.save().unwrap();

        let fresh = SessionRegistry::with_http(
            Arc::clone(registry.config()),
            Arc::clone(registry.session_book()),
            reqwest::Client::new(),
        );
        let restored = fresh.restore();
        assert_eq!(restored.len(), 1);
        let client = fresh.get_client("s1", "test").unwrap();
        assert_eq!(client.external_identity().as_deref(), Some("U1"));
        assert_eq!(client.title().as_deref(), Some("Home"));
        assert_eq!(client.state(), ClientState::Authorized);
    }

    #[test]
    fn destroy_client_forgets_session() {
        let registry = registry("http://127.0.0.1:1");
        let client = registry.create_client("s1", "test").unwrap();
        client.save().unwrap();
        assert_eq!(registry.saved_sessions().len(), 1);

        registry.destroy_client("s1", "test").unwrap();
        assert!(registry.saved_sessions().is_empty());
        assert!(registry.get_client("s1", "test").is_err());
        assert_eq!(client.state(), ClientState::Destroyed);
    }

    #[test]
    fn release_unsaved_drops_clients_logged_out_elsewhere() {
        let registry = registry("http://127.0.0.1:1");
        registry.create_client("s1", "test").unwrap().save().unwrap();
        registry.create_client("s2", "test").unwrap().save().unwrap();

        // Another process removes s2 from the shared session set.
        registry.session_book().remove("s2").unwrap();
        let released = registry.release_unsaved();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].session_id(), "s2");
        assert!(registry.get_client("s1", "test").is_ok());
        assert!(registry.get_client("s2", "test").is_err());
    }

    #[tokio::test]
    async fn code_exchange_through_registry_signs_with_new_token() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/access_token")
            .with_status(200)
            .with_body(
                r#"{"access_token":"T1","refresh_token":"R1","expires_in":3600,"openId":"U1"}"#,
            )
            .create_async()
            .await;
        let api = server
            .mock("POST", "/api")
            .match_header("accesstoken", "T1")
            .with_status(200)
            .with_body(r#"{"code":0,"result":{"data":[{"did":"lumi.1","model":"lumi.motion.agl001"}],"totalCount":1}}"#)
            .create_async()
            .await;

        let registry = registry(&server.url());
        let client = registry.create_client("s1", "test").unwrap();
        let token = client.exchange_code("abc").await.unwrap();
        assert!(token.is_refreshable());

        let devices = client.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].did, "lumi.1");
        api.assert_async().await;
    }
}
