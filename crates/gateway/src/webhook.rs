//! Push-notification registration.
//!
//! [`WebhookRegistrar`] keeps exactly one registration alive on a
//! [`WebhookHost`], keyed by the external identities of every saved session.
//! [`HttpWebhookHost`] is the bundled host: it serves `POST /webhook/{id}`
//! and verifies an HMAC-SHA256 signature over the raw body.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    axum::{
        Json, Router,
        body::Bytes,
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::post,
    },
    hmac::{Hmac, Mac},
    hublink_oauth::SessionBook,
    secrecy::{ExposeSecret, Secret},
    serde_json::{Value, json},
    sha2::Sha256,
    tokio::{
        sync::{Mutex, RwLock, mpsc},
        task::JoinHandle,
    },
    tracing::{debug, warn},
};

use crate::diag::DiagLog;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex digest>` of the request body.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook registration failed: {0}")]
    Registration(String),

    #[error("webhook unregistration failed: {0}")]
    Unregistration(String),
}

// ── Host interface ───────────────────────────────────────────────────────────

/// Receives the body of every accepted push.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, body: Value);
}

/// A live registration.
#[async_trait]
pub trait WebhookSubscription: Send + Sync {
    async fn unregister(&self) -> Result<(), WebhookError>;
}

#[async_trait]
pub trait WebhookHost: Send + Sync {
    async fn register(
        &self,
        id: &str,
        secret: &Secret<String>,
        keys: &BTreeSet<String>,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<Box<dyn WebhookSubscription>, WebhookError>;
}

// ── HTTP host ────────────────────────────────────────────────────────────────

struct ActiveRoute {
    generation: u64,
    id: String,
    secret: Secret<String>,
    keys: BTreeSet<String>,
    handler: Arc<dyn WebhookHandler>,
}

#[derive(Default)]
struct HostInner {
    active: Option<Arc<ActiveRoute>>,
    generation: u64,
}

/// In-process host. The router stays mounted for the life of the process;
/// registrations swap the route it answers for.
#[derive(Clone, Default)]
pub struct HttpWebhookHost {
    inner: Arc<RwLock<HostInner>>,
}

impl HttpWebhookHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/webhook/{id}", post(webhook_handler))
            .with_state(self.clone())
    }

    /// Keys of the current registration, if any.
    pub async fn registered_keys(&self) -> Option<BTreeSet<String>> {
        self.inner
            .read()
            .await
            .active
            .as_ref()
            .map(|route| route.keys.clone())
    }
}

struct HttpSubscription {
    host: HttpWebhookHost,
    generation: u64,
}

#[async_trait]
impl WebhookSubscription for HttpSubscription {
    async fn unregister(&self) -> Result<(), WebhookError> {
        let mut inner = self.host.inner.write().await;
        if inner
            .active
            .as_ref()
            .is_some_and(|route| route.generation == self.generation)
        {
            inner.active = None;
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookHost for HttpWebhookHost {
    async fn register(
        &self,
        id: &str,
        secret: &Secret<String>,
        keys: &BTreeSet<String>,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<Box<dyn WebhookSubscription>, WebhookError> {
        if id.is_empty() {
            return Err(WebhookError::Registration("webhook id is empty".into()));
        }
        let mut inner = self.inner.write().await;
        inner.generation += 1;
        let generation = inner.generation;
        inner.active = Some(Arc::new(ActiveRoute {
            generation,
            id: id.into(),
            secret: secret.clone(),
            keys: keys.clone(),
            handler,
        }));
        Ok(Box::new(HttpSubscription {
            host: self.clone(),
            generation,
        }))
    }
}

fn keyed_mac(secret: &str, body: &[u8]) -> Option<HmacSha256> {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()) else {
        return None;
    };
    mac.update(body);
    Some(mac)
}

/// Hex HMAC-SHA256 of `body`, as carried in [`SIGNATURE_HEADER`].
pub fn sign_body(secret: &str, body: &[u8]) -> Option<String> {
    let mac = keyed_mac(secret, body)?;
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(digest) = header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    keyed_mac(secret, body).is_some_and(|mac| mac.verify_slice(&expected).is_ok())
}

async fn webhook_handler(
    State(host): State<HttpWebhookHost>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(route) = host.inner.read().await.active.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if route.id != id {
        return StatusCode::NOT_FOUND.into_response();
    }

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if !verify_signature(route.secret.expose_secret(), &body, signature) {
        warn!("webhook push with bad signature rejected");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "webhook push is not JSON");
            return StatusCode::BAD_REQUEST.into_response();
        },
    };

    let accepted = payload["openId"]
        .as_str()
        .is_some_and(|open_id| route.keys.contains(open_id));
    if accepted {
        let handler = Arc::clone(&route.handler);
        tokio::spawn(async move { handler.handle(payload).await });
    } else {
        debug!(open_id = %payload["openId"], "webhook push for unregistered key ignored");
    }
    Json(json!({ "code": 0 })).into_response()
}

// ── Registrar ────────────────────────────────────────────────────────────────

/// Result of one registration cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Registered(usize),
    Unchanged,
    Empty,
    Failed,
}

#[derive(Default)]
struct Registration {
    subscription: Option<Box<dyn WebhookSubscription>>,
    keys: BTreeSet<String>,
}

/// Keeps the single registration in step with the session set.
///
/// Cycles are serialized: a cycle holds the registration lock from its
/// unregister step through its register step. A failed or empty cycle arms
/// one retry timer; starting any cycle cancels the pending timer.
pub struct WebhookRegistrar {
    host: Arc<dyn WebhookHost>,
    sessions: Arc<SessionBook>,
    handler: Arc<dyn WebhookHandler>,
    diag: Arc<DiagLog>,
    id: String,
    secret: Secret<String>,
    retry_delay: Duration,
    current: Mutex<Registration>,
    retry_timer: StdMutex<Option<JoinHandle<()>>>,
    retry_tx: mpsc::UnboundedSender<()>,
    retry_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl WebhookRegistrar {
    pub fn new(
        host: Arc<dyn WebhookHost>,
        sessions: Arc<SessionBook>,
        handler: Arc<dyn WebhookHandler>,
        diag: Arc<DiagLog>,
        id: &str,
        secret: Secret<String>,
        retry_delay: Duration,
    ) -> Self {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        Self {
            host,
            sessions,
            handler,
            diag,
            id: id.into(),
            secret,
            retry_delay,
            current: Mutex::new(Registration::default()),
            retry_timer: StdMutex::new(None),
            retry_tx,
            retry_rx: Mutex::new(Some(retry_rx)),
        }
    }

    /// Keys of the live registration; empty when none exists.
    pub async fn registered_keys(&self) -> BTreeSet<String> {
        self.current.lock().await.keys.clone()
    }

    /// Bring the registration in line with the current session set.
    pub async fn sync(&self) -> SyncOutcome {
        let mut current = self.current.lock().await;
        self.cancel_retry();

        let keys = self.sessions.external_identities();
        if current.subscription.is_some() && current.keys == keys {
            return SyncOutcome::Unchanged;
        }

        if let Some(previous) = current.subscription.take() {
            current.keys.clear();
            if let Err(e) = previous.unregister().await {
                warn!(error = %e, "dropping stale webhook registration");
            }
        }

        if keys.is_empty() {
            debug!("no sessions with an identity yet, webhook registration deferred");
            self.schedule_retry();
            return SyncOutcome::Empty;
        }

        match self
            .host
            .register(&self.id, &self.secret, &keys, Arc::clone(&self.handler))
            .await
        {
            Ok(subscription) => {
                current.subscription = Some(subscription);
                current.keys = keys.clone();
                self.diag.info(&format!(
                    "Webhook registered for keys {}",
                    keys.iter().cloned().collect::<Vec<_>>().join(", ")
                ));
                SyncOutcome::Registered(keys.len())
            },
            Err(e) => {
                self.diag.error(&format!("{e}, retrying"));
                self.schedule_retry();
                SyncOutcome::Failed
            },
        }
    }

    /// Arm the retry timer unless one is already pending.
    fn schedule_retry(&self) {
        let mut slot = self
            .retry_timer
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if slot.as_ref().is_some_and(|timer| !timer.is_finished()) {
            return;
        }
        let tx = self.retry_tx.clone();
        let delay = self.retry_delay;
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(());
        }));
    }

    fn cancel_retry(&self) {
        if let Some(timer) = self
            .retry_timer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            timer.abort();
        }
    }

    /// Drive registration from session changes and retry ticks until the
    /// session book goes away. Only the first caller runs the loop.
    pub async fn run(&self) {
        let Some(mut retries) = self.retry_rx.lock().await.take() else {
            warn!("webhook registrar loop already running");
            return;
        };
        let mut changes = self.sessions.subscribe();

        self.sync().await;
        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                },
                Some(()) = retries.recv() => {},
            }
            self.sync().await;
        }
    }

    /// Drop the registration and any pending retry.
    pub async fn shutdown(&self) {
        let mut current = self.current.lock().await;
        self.cancel_retry();
        current.keys.clear();
        if let Some(subscription) = current.subscription.take()
            && let Err(e) = subscription.unregister().await
        {
            warn!(error = %e, "webhook unregistration failed during shutdown");
        }
    }
}
