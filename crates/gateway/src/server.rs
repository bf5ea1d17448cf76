use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        Router,
        extract::State,
        response::{IntoResponse, Json},
        routing::get,
    },
    hublink_config::HublinkConfig,
    tower_http::trace::TraceLayer,
    tracing::{error, info, warn},
};

use crate::{
    diag::DiagLog,
    dispatch::WebhookDispatcher,
    listener::DiagnosticListener,
    state::AppState,
    watcher::StoreWatcher,
    webhook::{HttpWebhookHost, WebhookRegistrar},
};

const STORE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Fallback for platforms or filesystems where watching fails.
const STORE_POLL_INTERVAL: Duration = Duration::from_secs(30);

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the HTTP router (shared between production startup and tests).
pub fn build_app(state: Arc<AppState>, host: &HttpWebhookHost) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
        .merge(host.router())
        .layer(TraceLayer::new_for_http())
}

/// Registrar for the configured webhook, or `None` when the id or secret
/// is missing.
pub fn build_registrar(
    state: &Arc<AppState>,
    host: &HttpWebhookHost,
) -> Option<Arc<WebhookRegistrar>> {
    let webhook = &state.config.webhook;
    let (Some(id), Some(secret)) = (webhook.id.as_deref(), webhook.secret.clone()) else {
        warn!("webhook id or secret not configured, push updates disabled");
        return None;
    };
    let dispatcher = Arc::new(WebhookDispatcher::new(Arc::clone(state)));
    Some(Arc::new(WebhookRegistrar::new(
        Arc::new(host.clone()),
        Arc::clone(state.sessions()),
        dispatcher,
        Arc::clone(&state.diag),
        id,
        secret,
        Duration::from_millis(webhook.retry_delay_ms),
    )))
}

/// Apply store changes made by other processes (pairing, logout, repair)
/// until the task is dropped. Runs on file events and on a fixed poll.
pub async fn follow_store(state: Arc<AppState>, poll_every: Duration) {
    let Some(path) = state.store_path.clone() else {
        return;
    };
    let (_watcher, mut changes) = match StoreWatcher::start(&path, STORE_DEBOUNCE) {
        Ok((watcher, changes)) => (Some(watcher), changes),
        Err(e) => {
            warn!(error = %e, "store watcher unavailable, polling only");
            (None, tokio::sync::mpsc::unbounded_channel().1)
        },
    };

    let mut poll = tokio::time::interval(poll_every);
    poll.tick().await;
    loop {
        tokio::select! {
            Some(()) = changes.recv() => {},
            _ = poll.tick() => {},
        }
        state.sync_with_store().await;
    }
}

/// Start the integration: restore sessions and devices, keep the webhook
/// registered and serve until ctrl-c.
pub async fn start(config: HublinkConfig) -> anyhow::Result<()> {
    let state = AppState::open(config)?;

    let sessions = state.registry.restore();
    state.install_config_drivers().await;
    let devices = state.restore_devices().await;

    let host = HttpWebhookHost::new();
    let registrar = build_registrar(&state, &host);
    if let Some(registrar) = &registrar {
        let registrar = Arc::clone(registrar);
        tokio::spawn(async move { registrar.run().await });
    }

    let follower = tokio::spawn(follow_store(Arc::clone(&state), STORE_POLL_INTERVAL));

    if state.config.listener.enabled {
        let listener = Arc::new(DiagnosticListener::new(
            &state.config.listener,
            state.sink.clone(),
            Arc::clone(&state.diag),
        ));
        let diag: Arc<DiagLog> = Arc::clone(&state.diag);
        tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!(error = %e, "diagnostic listener stopped");
                diag.error(&format!("Diagnostic listener stopped: {e}"));
            }
        });
    }

    let app = build_app(Arc::clone(&state), &host);
    let webhook = &state.config.webhook;
    let addr: SocketAddr = format!("{}:{}", webhook.bind, webhook.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let drivers = state.drivers().await;
    let lines = [
        format!("hublink v{}", state.version),
        format!("webhook receiver listening on {addr}"),
        format!(
            "{} session(s), {} device(s), {} driver(s)",
            sessions.len(),
            devices,
            drivers.len()
        ),
        format!(
            "push updates: {}, diagnostic listener: {}",
            if registrar.is_some() { "on" } else { "off" },
            if state.config.listener.enabled {
                format!("port {}", state.config.listener.port)
            } else {
                "off".into()
            }
        ),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    follower.abort();
    if let Some(registrar) = registrar {
        registrar.shutdown().await;
    }
    info!("hublink stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut devices = 0;
    for driver in state.drivers().await {
        devices += driver.devices().len();
    }
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "sessions": state.registry.clients().len(),
        "devices": devices,
        "diagnostics_log": state.diag.is_enabled(),
    }))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            testing::{app_state, config, region_id},
            webhook::WebhookHost,
        },
        axum::{body::Body, http::Request},
        hublink_oauth::{MemoryStore, OAuth2Token},
        secrecy::Secret,
        serde_json::Value,
        std::collections::BTreeSet,
        tower::ServiceExt,
    };

    #[tokio::test]
    async fn health_reports_counts() {
        let state = app_state();
        state.install_config_drivers().await;
        let app = build_app(Arc::clone(&state), &HttpWebhookHost::new());

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["devices"], 0);
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn webhook_routes_are_mounted() {
        let state = app_state();
        let host = HttpWebhookHost::new();
        let handler = Arc::new(WebhookDispatcher::new(Arc::clone(&state)));
        let _subscription = host
            .register(
                "hook-1",
                &Secret::new("s3cret".into()),
                &BTreeSet::from(["U1".to_string()]),
                handler,
            )
            .await
            .unwrap();
        let app = build_app(state, &host);

        // Unsigned push reaches the webhook route and is refused there.
        let response = app
            .oneshot(
                Request::post("/webhook/hook-1")
                    .body(Body::from(r#"{"openId":"U1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
    }

    #[test]
    fn registrar_needs_id_and_secret() {
        let host = HttpWebhookHost::new();
        assert!(build_registrar(&app_state(), &host).is_none());

        let mut config = config("http://127.0.0.1:1");
        config.webhook.id = Some("hook-1".into());
        config.webhook.secret = Some(Secret::new("s3cret".into()));
        let state = AppState::new(config, Arc::new(MemoryStore::new())).unwrap();
        assert!(build_registrar(&state, &host).is_some());
    }

    fn save_session(state: &AppState, session_id: &str, open_id: &str) {
        let client = state.registry.create_client(session_id, region_id()).unwrap();
        client.set_token(OAuth2Token::new(
            Some("T".into()),
            Some("R".into()),
            None,
            None,
            Some(open_id.into()),
        ));
        client.save().unwrap();
    }

    async fn wait_for_keys(host: &HttpWebhookHost, expected: &[&str]) -> Option<BTreeSet<String>> {
        let expected: BTreeSet<String> = expected.iter().map(|k| k.to_string()).collect();
        for _ in 0..200 {
            let keys = host.registered_keys().await;
            if keys.as_ref() == Some(&expected) {
                return keys;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        host.registered_keys().await
    }

    #[tokio::test]
    async fn sessions_changed_by_another_process_reach_the_registration() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config("http://127.0.0.1:1");
        cfg.store_path = Some(dir.path().join("store.json"));
        cfg.webhook.id = Some("hook-1".into());
        cfg.webhook.secret = Some(Secret::new("s3cret".into()));
        cfg.webhook.retry_delay_ms = 20;

        let serving = AppState::open(cfg.clone()).unwrap();
        let host = HttpWebhookHost::new();
        let registrar = build_registrar(&serving, &host).unwrap();
        let runner = Arc::clone(&registrar);
        let run = tokio::spawn(async move { runner.run().await });
        let follow = tokio::spawn(follow_store(
            Arc::clone(&serving),
            Duration::from_millis(50),
        ));

        // Pairing and logout run as separate processes over the same file.
        let other = AppState::open(cfg).unwrap();
        save_session(&other, "s1", "A");
        let first = wait_for_keys(&host, &["A"]).await;
        save_session(&other, "s2", "B");
        let both = wait_for_keys(&host, &["A", "B"]).await;
        other.registry.destroy_client("s1", region_id()).unwrap();
        let last = wait_for_keys(&host, &["B"]).await;
        run.abort();
        follow.abort();

        assert_eq!(first, Some(BTreeSet::from(["A".to_string()])));
        assert_eq!(both, Some(BTreeSet::from(["A".to_string(), "B".to_string()])));
        assert_eq!(last, Some(BTreeSet::from(["B".to_string()])));
        assert_eq!(registrar.registered_keys().await, BTreeSet::from(["B".to_string()]));
        assert!(serving.registry.get_client("s2", region_id()).is_ok());
        assert!(serving.registry.get_client("s1", region_id()).is_err());
    }

    #[tokio::test]
    async fn in_memory_state_has_nothing_to_follow() {
        let follow = follow_store(app_state(), Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(1), follow)
            .await
            .unwrap();
    }
}
