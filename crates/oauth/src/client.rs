//! One authenticated vendor session: token exchange, refresh and signed calls.

use std::sync::{Arc, Mutex, MutexGuard};

use {
    hublink_config::RegionConfig,
    reqwest::{Method, StatusCode},
    secrecy::{ExposeSecret, Secret},
    serde_json::Value,
    tokio::sync::broadcast,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    intent::{ApiResponse, DeviceInfo, DeviceInfoPage, DeviceInfoQuery, Intent, ResourceValue},
    sessions::{SavedSession, SessionBook},
    signer::RequestSigner,
    token::OAuth2Token,
};

/// Lifecycle of a client.
///
/// `Uninitialized -> PendingAuthorization -> Authorized -> Destroyed`. A
/// failed exchange or refresh leaves the client in `PendingAuthorization`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    PendingAuthorization,
    Authorized,
    Destroyed,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::PendingAuthorization => "pending authorization",
            Self::Authorized => "authorized",
            Self::Destroyed => "destroyed",
        }
    }
}

/// Notifications published to [`OAuth2Client::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    TokenRefreshed,
    Saved,
    Destroyed,
}

/// Identity of a freshly authorized session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub title: String,
}

struct ClientInner {
    token: OAuth2Token,
    title: Option<String>,
    state: ClientState,
}

pub struct OAuth2Client {
    session_id: String,
    config_id: String,
    region: RegionConfig,
    http: reqwest::Client,
    sessions: Arc<SessionBook>,
    inner: Mutex<ClientInner>,
    events: broadcast::Sender<ClientEvent>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for OAuth2Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("OAuth2Client")
            .field("session_id", &self.session_id)
            .field("config_id", &self.config_id)
            .field("state", &inner.state)
            .field("token", &inner.token)
            .finish()
    }
}

impl OAuth2Client {
    pub fn new(
        session_id: &str,
        config_id: &str,
        region: RegionConfig,
        http: reqwest::Client,
        sessions: Arc<SessionBook>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            session_id: session_id.into(),
            config_id: config_id.into(),
            region,
            http,
            sessions,
            inner: Mutex::new(ClientInner {
                token: OAuth2Token::default(),
                title: None,
                state: ClientState::Uninitialized,
            }),
            events,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn state(&self) -> ClientState {
        self.lock().state
    }

    pub fn title(&self) -> Option<String> {
        self.lock().title.clone()
    }

    pub fn set_title(&self, title: Option<String>) {
        self.lock().title = title;
    }

    pub fn token(&self) -> OAuth2Token {
        self.lock().token.clone()
    }

    /// Replace the token wholesale. A token carrying an access token marks
    /// the client authorized.
    pub fn set_token(&self, token: OAuth2Token) {
        let mut inner = self.lock();
        if inner.state != ClientState::Destroyed && token.access_token().is_some() {
            inner.state = ClientState::Authorized;
        }
        inner.token = token;
    }

    pub fn external_identity(&self) -> Option<String> {
        self.lock().token.external_identity().map(str::to_string)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn ensure_live(&self) -> Result<()> {
        match self.state() {
            ClientState::Destroyed => Err(Error::InvalidState(ClientState::Destroyed.as_str())),
            _ => Ok(()),
        }
    }

    fn set_state(&self, state: ClientState) {
        let mut inner = self.lock();
        if inner.state != ClientState::Destroyed {
            inner.state = state;
        }
    }

    fn begin_authorization(&self) {
        let mut inner = self.lock();
        if inner.state == ClientState::Uninitialized {
            inner.state = ClientState::PendingAuthorization;
        }
    }

    fn client_credentials(&self) -> Result<(String, Secret<String>)> {
        let app_id = self
            .region
            .app_id
            .clone()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Config(format!("no app id for region {}", self.config_id)))?;
        let app_key = self
            .region
            .app_key
            .clone()
            .filter(|v| !v.expose_secret().is_empty())
            .ok_or_else(|| Error::Config(format!("no app key for region {}", self.config_id)))?;
        Ok((app_id, app_key))
    }

    fn endpoint<'a>(&self, value: &'a Option<String>, what: &str) -> Result<&'a str> {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Config(format!("no {what} for region {}", self.config_id)))
    }

    // ── Authorization ───────────────────────────────────────────────────────

    /// Redirect URL for the authorization-code flow.
    pub fn authorization_url(&self) -> Result<String> {
        self.ensure_live()?;
        let (app_id, _) = self.client_credentials()?;
        let base = self.endpoint(&self.region.authorization_url, "authorization url")?;
        let redirect = self.endpoint(&self.region.redirect_url, "redirect url")?;

        let mut url = url::Url::parse(base)
            .map_err(|e| Error::Config(format!("invalid authorization url {base}: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &app_id)
                .append_pair("response_type", "code")
                .append_pair("redirect_uri", redirect)
                .append_pair("state", &self.session_id);
            if let Some(scopes) = self.region.scopes.as_ref().filter(|s| !s.is_empty()) {
                query.append_pair("scope", &scopes.join(" "));
            }
        }
        self.begin_authorization();
        Ok(url.into())
    }

    /// Complete the authorization-code flow.
    pub async fn exchange_code(&self, code: &str) -> Result<OAuth2Token> {
        self.ensure_live()?;
        self.begin_authorization();
        let redirect = self
            .region
            .redirect_url
            .clone()
            .unwrap_or_default();
        let token = self
            .exchange(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &redirect),
            ])
            .await?;
        self.set_token(token.clone());
        info!(session_id = %self.session_id, "authorized by code");
        Ok(token)
    }

    /// Exchange account credentials for a token.
    pub async fn exchange_credentials(&self, username: &str, password: &str) -> Result<OAuth2Token> {
        self.ensure_live()?;
        self.begin_authorization();
        let token = self
            .exchange(&[
                ("grant_type", "password"),
                ("username", username),
                ("password", password),
            ])
            .await?;
        self.set_token(token.clone());
        info!(session_id = %self.session_id, "authorized by credentials");
        Ok(token)
    }

    /// Swap the refresh token for a new token.
    ///
    /// On rejection the client drops back to `PendingAuthorization`; the
    /// caller decides whether to start re-authorization.
    pub async fn refresh(&self) -> Result<OAuth2Token> {
        let seen = self.token().access_token().map(str::to_string);
        self.refresh_after(seen).await
    }

    /// Refresh unless another caller already replaced `seen` while this one
    /// waited for the refresh lock.
    async fn refresh_after(&self, seen: Option<String>) -> Result<OAuth2Token> {
        self.ensure_live()?;
        let _guard = self.refresh_lock.lock().await;

        let current = self.token();
        if current.access_token() != seen.as_deref()
            && current.access_token().is_some()
            && self.state() == ClientState::Authorized
        {
            debug!(session_id = %self.session_id, "token already refreshed by another caller");
            return Ok(current);
        }
        let refresh_token = current
            .refresh_token()
            .map(str::to_string)
            .ok_or_else(|| Error::Auth {
                message: "session has no refresh token".into(),
                code: None,
            })?;

        let result = self
            .exchange(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &refresh_token),
            ])
            .await;

        let token = match result {
            // The account behind a session never changes.
            Ok(token) => token.or_identity(current.external_identity().map(str::to_string)),
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "token refresh rejected");
                self.set_state(ClientState::PendingAuthorization);
                return Err(e);
            },
        };
        self.set_token(token.clone());

        if self.sessions.contains(&self.session_id) {
            self.save()?;
        }
        let _ = self.events.send(ClientEvent::TokenRefreshed);
        debug!(session_id = %self.session_id, "token refreshed");
        Ok(token)
    }

    async fn exchange(&self, grant: &[(&str, &str)]) -> Result<OAuth2Token> {
        let (app_id, app_key) = self.client_credentials()?;
        let token_url = self.endpoint(&self.region.token_url, "token url")?;

        let mut form: Vec<(&str, &str)> = grant.to_vec();
        form.push(("client_id", &app_id));
        form.push(("client_secret", app_key.expose_secret()));

        let response = self.http.post(token_url).form(&form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(auth_error(status, &body));
        }
        parse_token_response(&body)
    }

    /// Identity for a session that just completed authorization.
    pub fn session_information(&self) -> SessionInfo {
        SessionInfo {
            id: uuid::Uuid::new_v4().to_string(),
            title: self
                .external_identity()
                .unwrap_or_else(|| format!("Account ({})", self.config_id)),
        }
    }

    // ── Signed API calls ────────────────────────────────────────────────────

    /// Issue a signed API call and return the parsed body.
    ///
    /// A 401 with a refreshable token triggers one refresh and one retry.
    pub async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        self.ensure_live()?;
        let sent = self.token();
        let mut response = self.send_signed(method.clone(), path, body).await?;

        if response.status() == StatusCode::UNAUTHORIZED && sent.is_refreshable() {
            debug!(session_id = %self.session_id, "access token rejected, refreshing");
            self.refresh_after(sent.access_token().map(str::to_string))
                .await?;
            response = self.send_signed(method, path, body).await?;
        }

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(api_error(status, &text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| Error::parse("API response", e))
    }

    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let signer = RequestSigner::from_region(&self.region)?;
        let api_url = self.endpoint(&self.region.api_url, "api url")?;
        let url = if path.is_empty() {
            api_url.to_string()
        } else {
            format!(
                "{}/{}",
                api_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };

        let headers = signer.sign(self.token().access_token());
        let mut request = headers.apply(self.http.request(method, url))?;
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Post a vendor intent envelope.
    pub async fn call_intent(&self, intent: &Intent) -> Result<ApiResponse> {
        let body = serde_json::to_value(intent).map_err(|e| Error::parse("intent", e))?;
        let value = self.call(Method::POST, "", Some(&body)).await?;
        serde_json::from_value(value).map_err(|e| Error::parse("intent response", e))
    }

    pub async fn query_device_info(&self, query: DeviceInfoQuery) -> Result<DeviceInfoPage> {
        let response = self.call_intent(&Intent::QueryDeviceInfo(query)).await?;
        Ok(response.decode("device info")?.unwrap_or_default())
    }

    /// Every device on the account, following pagination.
    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut devices = Vec::new();
        let mut query = DeviceInfoQuery::default();
        loop {
            let page = self.query_device_info(query.clone()).await?;
            let fetched = page.data.len();
            devices.extend(page.data);
            if fetched == 0 || devices.len() as u32 >= page.total_count {
                break;
            }
            query.page_num += 1;
        }
        Ok(devices)
    }

    /// Current resource values, or `None` when the device is offline.
    pub async fn query_resource_values(
        &self,
        subject_id: &str,
        resource_ids: &[String],
    ) -> Result<Option<Vec<ResourceValue>>> {
        let response = self
            .call_intent(&Intent::query_resource_value(subject_id, resource_ids))
            .await?;
        if response.is_device_offline() {
            return Ok(None);
        }
        Ok(Some(response.decode("resource values")?.unwrap_or_default()))
    }

    /// Subscribe to push updates. Returns `false` when the device is offline.
    pub async fn subscribe_resources(&self, subject_id: &str, resource_ids: &[String]) -> Result<bool> {
        let response = self
            .call_intent(&Intent::subscribe(subject_id, resource_ids))
            .await?;
        if response.is_device_offline() {
            return Ok(false);
        }
        response.decode::<Value>("subscribe")?;
        Ok(true)
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    pub fn save(&self) -> Result<()> {
        self.ensure_live()?;
        let session = {
            let inner = self.lock();
            SavedSession {
                config_id: self.config_id.clone(),
                token: inner.token.clone(),
                title: inner.title.clone(),
            }
        };
        self.sessions.upsert(&self.session_id, session)?;
        let _ = self.events.send(ClientEvent::Saved);
        Ok(())
    }

    /// Notify subscribers, then discard the persisted session.
    pub fn destroy(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.state == ClientState::Destroyed {
                return Ok(());
            }
            inner.state = ClientState::Destroyed;
        }
        let _ = self.events.send(ClientEvent::Destroyed);
        self.sessions.remove(&self.session_id)?;
        debug!(session_id = %self.session_id, "client destroyed");
        Ok(())
    }
}

fn json_message(body: &Value) -> Option<String> {
    ["error_description", "message", "msgDetails", "error"]
        .iter()
        .filter_map(|key| match &body[*key] {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Object(obj) => obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .next()
}

fn fallback_message(status: StatusCode, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status.to_string()
    } else {
        trimmed.to_string()
    }
}

fn auth_error(status: StatusCode, body: &str) -> Error {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    Error::Auth {
        message: json_message(&parsed).unwrap_or_else(|| fallback_message(status, body)),
        code: parsed["code"]
            .as_i64()
            .or(Some(i64::from(status.as_u16()))),
    }
}

/// Non-OK API response: the error comes from the body's `error` field.
fn api_error(status: StatusCode, body: &str) -> Error {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let error = &parsed["error"];
    let message = match error {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => json_message(&parsed),
    };
    Error::Api {
        code: error["code"]
            .as_i64()
            .or_else(|| parsed["code"].as_i64())
            .unwrap_or(i64::from(status.as_u16())),
        message: message.unwrap_or_else(|| fallback_message(status, body)),
    }
}

/// Token payloads come either bare or wrapped in the `{code, message, result}`
/// envelope.
fn parse_token_response(body: &str) -> Result<OAuth2Token> {
    let value: Value = serde_json::from_str(body).map_err(|e| Error::parse("token response", e))?;

    match value["code"].as_i64() {
        Some(code) if code != 0 => {
            return Err(Error::Auth {
                message: json_message(&value).unwrap_or_else(|| format!("vendor code {code}")),
                code: Some(code),
            });
        },
        _ => {},
    }

    let payload = match value.get("result") {
        Some(result @ Value::Object(_)) => result.clone(),
        _ => value,
    };
    let token: OAuth2Token =
        serde_json::from_value(payload).map_err(|e| Error::parse("token response", e))?;
    if token.access_token().is_none() {
        return Err(Error::Auth {
            message: "token response did not include an access token".into(),
            code: None,
        });
    }
    Ok(token)
}
