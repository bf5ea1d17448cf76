//! Pairing flow as an explicit state machine.
//!
//! ```text
//! SelectRegion -> LoginChoice -> LoginCredentials -> ListDevices -> AddDevice -> Done
//!                             \-> LoginOAuth2 ------/
//! ```
//!
//! A region with an authorized saved session skips the login steps.
//! Otherwise a temporary client is created for the login; once authorized it
//! is replaced by a client registered under its permanent session id.
//!
//! Repair starts from an existing session instead of a region: the login
//! steps re-authorize that session under its own id, then its paired devices
//! are initialized again and the flow ends.

use std::sync::Arc;

use {
    hublink_oauth::{ClientState, OAuth2Client, SavedSession},
    serde::Serialize,
    tracing::{debug, info, warn},
};

use crate::{
    device::{DeviceLifecycle, DriverLifecycle, PairableDevice},
    state::{AppState, PairedDevice},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStep {
    SelectRegion,
    LoginChoice,
    LoginCredentials,
    LoginOAuth2,
    ListDevices,
    AddDevice,
    Done,
}

#[derive(Debug, Clone)]
pub enum PairingEvent {
    SelectRegion { config_id: String },
    Repair { session_id: String },
    ChooseCredentials,
    ChooseOAuth2,
    Login { username: String, password: String },
    AuthorizationCode { code: String },
    ListDevices,
    AddDevices { devices: Vec<PairableDevice> },
}

impl PairingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SelectRegion { .. } => "select_region",
            Self::Repair { .. } => "repair",
            Self::ChooseCredentials => "choose_credentials",
            Self::ChooseOAuth2 => "choose_oauth2",
            Self::Login { .. } => "login",
            Self::AuthorizationCode { .. } => "authorization_code",
            Self::ListDevices => "list_devices",
            Self::AddDevices { .. } => "add_devices",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("{event} is not valid at step {step:?}")]
    UnexpectedEvent {
        event: &'static str,
        step: PairingStep,
    },

    /// The vendor rejected the login or the device listing.
    #[error("{0}")]
    Vendor(String),

    #[error("no saved session {0}")]
    UnknownSession(String),

    #[error(transparent)]
    Session(#[from] hublink_oauth::Error),
}

impl PairingError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Vendor(message) => message.clone(),
            Self::Session(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

fn vendor_error(e: hublink_oauth::Error) -> PairingError {
    match e {
        hublink_oauth::Error::Auth { .. } | hublink_oauth::Error::Api { .. } => {
            PairingError::Vendor(e.user_message())
        },
        other => PairingError::Session(other),
    }
}

pub struct PairingSession {
    state: Arc<AppState>,
    driver: Arc<dyn DriverLifecycle>,
    step: PairingStep,
    config_id: Option<String>,
    client: Option<Arc<OAuth2Client>>,
    temporary: bool,
    reused: bool,
    repairing: bool,
    authorization_url: Option<String>,
    listed: Vec<PairableDevice>,
    reinitialized: usize,
}

impl PairingSession {
    pub fn new(state: Arc<AppState>, driver: Arc<dyn DriverLifecycle>) -> Self {
        Self {
            state,
            driver,
            step: PairingStep::SelectRegion,
            config_id: None,
            client: None,
            temporary: false,
            reused: false,
            repairing: false,
            authorization_url: None,
            listed: Vec::new(),
            reinitialized: 0,
        }
    }

    pub fn step(&self) -> PairingStep {
        self.step
    }

    pub fn config_id(&self) -> Option<&str> {
        self.config_id.as_deref()
    }

    pub fn client(&self) -> Option<&Arc<OAuth2Client>> {
        self.client.as_ref()
    }

    /// Whether the selected region already had a saved session.
    pub fn is_reusing_session(&self) -> bool {
        self.reused
    }

    pub fn authorization_url(&self) -> Option<&str> {
        self.authorization_url.as_deref()
    }

    pub fn is_repairing(&self) -> bool {
        self.repairing
    }

    /// Devices initialized again after the session was re-authorized.
    pub fn reinitialized(&self) -> usize {
        self.reinitialized
    }

    /// Devices from the last listing.
    pub fn listed(&self) -> &[PairableDevice] {
        &self.listed
    }

    /// Feed one event. Failures leave the step unchanged.
    pub async fn handle(&mut self, event: PairingEvent) -> Result<PairingStep, PairingError> {
        match event {
            PairingEvent::SelectRegion { config_id } => self.select_region(&config_id)?,
            PairingEvent::Repair { session_id } => self.repair(&session_id)?,
            PairingEvent::ChooseCredentials => self.choose_credentials()?,
            PairingEvent::ChooseOAuth2 => self.choose_oauth2()?,
            PairingEvent::Login { username, password } => self.login(&username, &password).await?,
            PairingEvent::AuthorizationCode { code } => self.complete_oauth2(&code).await?,
            PairingEvent::ListDevices => {
                self.list_devices().await?;
            },
            PairingEvent::AddDevices { devices } => {
                self.add_devices(&devices).await?;
            },
        }
        Ok(self.step)
    }

    fn expect_step(&self, step: PairingStep, event: &'static str) -> Result<(), PairingError> {
        if self.step == step {
            Ok(())
        } else {
            Err(PairingError::UnexpectedEvent {
                event,
                step: self.step,
            })
        }
    }

    fn current_client(&self, event: &'static str) -> Result<Arc<OAuth2Client>, PairingError> {
        self.client
            .clone()
            .ok_or(PairingError::UnexpectedEvent {
                event,
                step: self.step,
            })
    }

    // ── Steps ───────────────────────────────────────────────────────────────

    pub fn select_region(&mut self, config_id: &str) -> Result<(), PairingError> {
        self.expect_step(PairingStep::SelectRegion, "select_region")?;
        let registry = &self.state.registry;

        let saved = registry
            .saved_sessions()
            .into_iter()
            .find(|(_, s)| s.config_id == config_id);

        let (client, reused) = match saved {
            Some((session_id, saved)) => {
                debug!(session_id, config_id, "reusing saved session");
                let client = match registry.get_client(&session_id, config_id) {
                    Ok(client) => client,
                    Err(_) => self.revive(&session_id, saved)?,
                };
                (client, true)
            },
            None => {
                let temp_id = format!("$new-{}", uuid::Uuid::new_v4());
                (registry.create_client(&temp_id, config_id)?, false)
            },
        };

        self.reused = reused;
        self.temporary = !reused;

        self.config_id = Some(config_id.to_string());
        self.client = Some(client);
        self.step = PairingStep::LoginChoice;
        Ok(())
    }

    fn revive(
        &self,
        session_id: &str,
        saved: SavedSession,
    ) -> Result<Arc<OAuth2Client>, PairingError> {
        let client = self
            .state
            .registry
            .create_client(session_id, &saved.config_id)?;
        client.set_title(saved.title);
        client.set_token(saved.token);
        Ok(client)
    }

    /// Start re-authorizing a saved session, typically one whose refresh
    /// token was rejected.
    pub fn repair(&mut self, session_id: &str) -> Result<(), PairingError> {
        self.expect_step(PairingStep::SelectRegion, "repair")?;
        let registry = &self.state.registry;
        let Some(saved) = registry.saved_sessions().remove(session_id) else {
            return Err(PairingError::UnknownSession(session_id.into()));
        };
        let config_id = saved.config_id.clone();
        let client = match registry.get_client(session_id, &config_id) {
            Ok(client) => client,
            Err(_) => self.revive(session_id, saved)?,
        };
        debug!(session_id, config_id, "repairing session");

        self.reused = true;
        self.temporary = false;
        self.repairing = true;
        self.config_id = Some(config_id);
        self.client = Some(client);
        self.step = PairingStep::LoginChoice;
        Ok(())
    }

    /// A reused session needs a login when it is being repaired or its
    /// token no longer works.
    fn needs_login(&self) -> bool {
        if !self.reused || self.repairing {
            return true;
        }
        self.client
            .as_ref()
            .is_none_or(|c| c.state() != ClientState::Authorized)
    }

    pub fn choose_credentials(&mut self) -> Result<(), PairingError> {
        self.expect_step(PairingStep::LoginChoice, "choose_credentials")?;
        self.step = if self.needs_login() {
            PairingStep::LoginCredentials
        } else {
            PairingStep::ListDevices
        };
        Ok(())
    }

    pub fn choose_oauth2(&mut self) -> Result<(), PairingError> {
        self.expect_step(PairingStep::LoginChoice, "choose_oauth2")?;
        if !self.needs_login() {
            self.step = PairingStep::ListDevices;
            return Ok(());
        }
        let client = self.current_client("choose_oauth2")?;
        self.authorization_url = Some(client.authorization_url()?);
        self.step = PairingStep::LoginOAuth2;
        Ok(())
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), PairingError> {
        self.expect_step(PairingStep::LoginCredentials, "login")?;
        let client = self.current_client("login")?;
        client
            .exchange_credentials(username, password)
            .await
            .map_err(vendor_error)?;
        self.authorized().await
    }

    pub async fn complete_oauth2(&mut self, code: &str) -> Result<(), PairingError> {
        self.expect_step(PairingStep::LoginOAuth2, "authorization_code")?;
        let client = self.current_client("authorization_code")?;
        client.exchange_code(code).await.map_err(vendor_error)?;
        self.authorized().await
    }

    /// After a successful login: promote a temporary client, or save a
    /// re-authorized session and bring its devices back.
    async fn authorized(&mut self) -> Result<(), PairingError> {
        if self.temporary {
            self.promote()?;
        } else {
            let client = self.current_client("login")?;
            client.save()?;
            self.reinitialized = self
                .state
                .reinit_session_devices(client.session_id())
                .await;
            info!(
                session_id = client.session_id(),
                devices = self.reinitialized,
                "session re-authorized"
            );
        }
        self.step = if self.repairing {
            PairingStep::Done
        } else {
            PairingStep::ListDevices
        };
        Ok(())
    }

    /// Replace the temporary client with one under its permanent id.
    fn promote(&mut self) -> Result<(), PairingError> {
        if !self.temporary {
            return Ok(());
        }
        let temp = self.current_client("login")?;
        let config_id = temp.config_id().to_string();
        let info = temp.session_information();
        let token = temp.token();

        self.state
            .registry
            .release_client(temp.session_id(), &config_id);
        temp.destroy()?;

        let client = self
            .state
            .registry
            .create_client(&info.id, &config_id)?;
        client.set_title(Some(info.title));
        client.set_token(token);
        info!(session_id = %info.id, config_id, "pairing session authorized");

        self.client = Some(client);
        self.temporary = false;
        Ok(())
    }

    pub async fn list_devices(&mut self) -> Result<&[PairableDevice], PairingError> {
        self.expect_step(PairingStep::ListDevices, "list_devices")?;
        let client = self.current_client("list_devices")?;
        self.listed = self
            .driver
            .on_pair_list_devices(&client)
            .await
            .map_err(vendor_error)?;
        self.step = PairingStep::AddDevice;
        Ok(&self.listed)
    }

    /// Persist the session, attach the selected devices and record them.
    pub async fn add_devices(
        &mut self,
        selected: &[PairableDevice],
    ) -> Result<Vec<Arc<dyn DeviceLifecycle>>, PairingError> {
        self.expect_step(PairingStep::AddDevice, "add_devices")?;
        let client = self.current_client("add_devices")?;
        client.save()?;

        let mut added = Vec::with_capacity(selected.len());
        let mut records = Vec::with_capacity(selected.len());
        for device in selected {
            let attached = self.driver.add_device(Arc::clone(&client), device);
            if let Err(e) = attached.on_init().await {
                self.state
                    .diag
                    .error(&format!("device {} failed to initialize: {e}", device.id));
            }
            records.push(PairedDevice {
                driver_id: self.driver.id().to_string(),
                session_id: client.session_id().to_string(),
                config_id: client.config_id().to_string(),
                device: device.clone(),
            });
            added.push(attached);
        }
        self.state.record_paired(&records)?;

        self.step = PairingStep::Done;
        Ok(added)
    }
}

impl Drop for PairingSession {
    fn drop(&mut self) {
        if !self.temporary {
            return;
        }
        if let Some(client) = self.client.take() {
            self.state
                .registry
                .release_client(client.session_id(), client.config_id());
            if let Err(e) = client.destroy() {
                warn!(error = %e, "failed to discard temporary pairing client");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            device::CapabilityValue,
            testing::{app_state_for, region_id},
        },
        hublink_oauth::{ClientState, OAuth2Token},
        mockito::{Matcher, Server, ServerGuard},
        serde_json::json,
    };

    async fn vendor() -> ServerGuard {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/access_token")
            .match_body(Matcher::UrlEncoded("password".into(), "bad".into()))
            .with_status(400)
            .with_body(r#"{"error_description":"invalid username or password"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/access_token")
            .match_body(Matcher::AnyOf(vec![
                Matcher::UrlEncoded("password".into(), "good".into()),
                Matcher::UrlEncoded("code".into(), "abc".into()),
            ]))
            .with_body(
                r#"{"code":0,"result":{"accessToken":"T1","refreshToken":"R1","expiresIn":"7200","openId":"U1"}}"#,
            )
            .create_async()
            .await;
        server
            .mock("POST", "/api")
            .match_body(Matcher::PartialJson(json!({"intent": "query.device.info"})))
            .with_body(
                r#"{"code":0,"result":{"data":[
                    {"did":"lumi.1","deviceName":"Hall","model":"lumi.motion.agl001"}
                ],"totalCount":1}}"#,
            )
            .create_async()
            .await;
        server
            .mock("POST", "/api")
            .match_body(Matcher::PartialJson(json!({"intent": "query.resource.value"})))
            .with_body(r#"{"code":0,"result":[{"subjectId":"lumi.1","resourceId":"3.51.85","value":"1"}]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/api")
            .match_body(Matcher::PartialJson(
                json!({"intent": "config.resource.subscribe"}),
            ))
            .with_body(r#"{"code":0}"#)
            .create_async()
            .await;
        server
    }

    async fn session(url: &str) -> (Arc<AppState>, PairingSession) {
        let state = app_state_for(url);
        state.install_config_drivers().await;
        let driver = state.driver("motion").await.unwrap();
        (Arc::clone(&state), PairingSession::new(state, driver))
    }

    #[tokio::test]
    async fn credentials_flow_pairs_a_device() {
        let server = vendor().await;
        let (state, mut pairing) = session(&server.url()).await;

        pairing.select_region(region_id()).unwrap();
        assert!(!pairing.is_reusing_session());
        let temp_id = pairing.client().unwrap().session_id().to_string();
        assert!(temp_id.starts_with("$new-"));

        pairing.choose_credentials().unwrap();
        assert_eq!(pairing.step(), PairingStep::LoginCredentials);

        let err = pairing.login("me@example.com", "bad").await.unwrap_err();
        assert_eq!(err.user_message(), "invalid username or password");
        assert_eq!(pairing.step(), PairingStep::LoginCredentials);

        pairing.login("me@example.com", "good").await.unwrap();
        assert_eq!(pairing.step(), PairingStep::ListDevices);
        let client = Arc::clone(pairing.client().unwrap());
        assert_ne!(client.session_id(), temp_id);
        assert_eq!(client.state(), ClientState::Authorized);
        assert_eq!(client.title().as_deref(), Some("U1"));
        assert!(state.registry.find_session(&temp_id).is_none());

        let listed = pairing.list_devices().await.unwrap().to_vec();
        assert_eq!(listed.len(), 1);
        assert_eq!(pairing.step(), PairingStep::AddDevice);

        let added = pairing.add_devices(&listed).await.unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(pairing.step(), PairingStep::Done);

        assert!(state.sessions().contains(client.session_id()));
        let paired = state.paired_devices();
        assert_eq!(paired.len(), 1);
        assert_eq!(paired[0].session_id, client.session_id());
        assert_eq!(
            state.capabilities.get("lumi.1", "alarm_motion"),
            Some(CapabilityValue::Boolean(true))
        );
    }

    #[tokio::test]
    async fn oauth2_flow_exposes_authorization_url() {
        let server = vendor().await;
        let (_state, mut pairing) = session(&server.url()).await;

        pairing
            .handle(PairingEvent::SelectRegion {
                config_id: region_id().into(),
            })
            .await
            .unwrap();
        let step = pairing.handle(PairingEvent::ChooseOAuth2).await.unwrap();
        assert_eq!(step, PairingStep::LoginOAuth2);
        let url = pairing.authorization_url().unwrap();
        assert!(url.contains("client_id=app-1"));
        assert!(url.contains("response_type=code"));

        let step = pairing
            .handle(PairingEvent::AuthorizationCode { code: "abc".into() })
            .await
            .unwrap();
        assert_eq!(step, PairingStep::ListDevices);
    }

    #[tokio::test]
    async fn authorized_saved_session_skips_login() {
        let server = vendor().await;
        let (state, mut pairing) = session(&server.url()).await;
        save_existing(&state);

        pairing.select_region(region_id()).unwrap();
        assert!(pairing.is_reusing_session());
        assert_eq!(pairing.client().unwrap().session_id(), "s1");
        pairing.choose_credentials().unwrap();
        assert_eq!(pairing.step(), PairingStep::ListDevices);
    }

    fn save_existing(state: &AppState) -> Arc<OAuth2Client> {
        let existing = state.registry.create_client("s1", region_id()).unwrap();
        existing.set_title(Some("Home".into()));
        existing.set_token(OAuth2Token::new(
            Some("OLD".into()),
            Some("R0".into()),
            None,
            None,
            Some("U1".into()),
        ));
        existing.save().unwrap();
        existing
    }

    #[tokio::test]
    async fn rejected_refresh_sends_saved_session_back_to_login() {
        let server = vendor().await;
        let (state, mut pairing) = session(&server.url()).await;
        let existing = save_existing(&state);
        // No token endpoint accepts R0.
        existing.refresh().await.unwrap_err();
        assert_eq!(existing.state(), ClientState::PendingAuthorization);

        pairing.select_region(region_id()).unwrap();
        assert!(pairing.is_reusing_session());
        pairing.choose_credentials().unwrap();
        assert_eq!(pairing.step(), PairingStep::LoginCredentials);

        pairing.login("me@example.com", "good").await.unwrap();
        assert_eq!(pairing.step(), PairingStep::ListDevices);
        let client = pairing.client().unwrap();
        assert_eq!(client.session_id(), "s1");
        assert_eq!(client.state(), ClientState::Authorized);
        let saved = state.registry.saved_sessions();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved["s1"].token.access_token(), Some("T1"));
        assert_eq!(saved["s1"].title.as_deref(), Some("Home"));
    }

    #[tokio::test]
    async fn repair_reauthorizes_in_place_and_reinitializes_devices() {
        let server = vendor().await;
        let (state, mut pairing) = session(&server.url()).await;
        save_existing(&state);
        state
            .record_paired(&[PairedDevice {
                driver_id: "motion".into(),
                session_id: "s1".into(),
                config_id: region_id().into(),
                device: PairableDevice {
                    id: "lumi.1".into(),
                    name: "Hall".into(),
                    model: "lumi.motion.agl001".into(),
                },
            }])
            .unwrap();

        let step = pairing
            .handle(PairingEvent::Repair {
                session_id: "s1".into(),
            })
            .await
            .unwrap();
        assert_eq!(step, PairingStep::LoginChoice);
        assert!(pairing.is_repairing());

        // Repair always logs in, even when the token still looks valid.
        let step = pairing.handle(PairingEvent::ChooseOAuth2).await.unwrap();
        assert_eq!(step, PairingStep::LoginOAuth2);
        assert!(pairing.authorization_url().unwrap().contains("state=s1"));

        let step = pairing
            .handle(PairingEvent::AuthorizationCode { code: "abc".into() })
            .await
            .unwrap();
        assert_eq!(step, PairingStep::Done);
        assert_eq!(pairing.reinitialized(), 1);
        assert_eq!(
            state.registry.saved_sessions()["s1"].token.access_token(),
            Some("T1")
        );
        assert_eq!(state.paired_devices().len(), 1);
        assert_eq!(
            state.capabilities.get("lumi.1", "alarm_motion"),
            Some(CapabilityValue::Boolean(true))
        );
        assert_eq!(state.registry.clients().len(), 1);
    }

    #[tokio::test]
    async fn repair_of_unknown_session_keeps_step() {
        let (_state, mut pairing) = session("http://127.0.0.1:1").await;
        let err = pairing.repair("missing").unwrap_err();
        assert!(matches!(err, PairingError::UnknownSession(_)));
        assert_eq!(err.user_message(), "no saved session missing");
        assert_eq!(pairing.step(), PairingStep::SelectRegion);
    }

    #[tokio::test]
    async fn out_of_order_events_are_rejected() {
        let (_state, mut pairing) = session("http://127.0.0.1:1").await;
        let err = pairing
            .handle(PairingEvent::Login {
                username: "a".into(),
                password: "b".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::UnexpectedEvent {
            event: "login",
            step: PairingStep::SelectRegion
        }));
        assert_eq!(pairing.step(), PairingStep::SelectRegion);
    }

    #[tokio::test]
    async fn unknown_region_keeps_step() {
        let (_state, mut pairing) = session("http://127.0.0.1:1").await;
        let err = pairing.select_region("atlantis").unwrap_err();
        assert!(matches!(err, PairingError::Session(_)));
        assert_eq!(pairing.step(), PairingStep::SelectRegion);
    }

    #[tokio::test]
    async fn abandoned_pairing_discards_temporary_client() {
        let (state, mut pairing) = session("http://127.0.0.1:1").await;
        pairing.select_region(region_id()).unwrap();
        assert_eq!(state.registry.clients().len(), 1);
        drop(pairing);
        assert!(state.registry.clients().is_empty());
    }
}
