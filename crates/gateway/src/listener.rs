//! Plain HTTP listener for manual diagnostics.
//!
//! Any request gets `{"code":0}` back right away; the raw body is relayed to
//! the diagnostic sink. Nothing received here reaches devices.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use {
    axum::{Json, Router, body::Bytes, extract::State},
    hublink_config::ListenerConfig,
    serde_json::{Value, json},
    tokio::net::TcpListener,
    tracing::{debug, info},
};

use crate::diag::{DiagLog, DiagnosticSink};

pub struct DiagnosticListener {
    addr: SocketAddr,
    retry_delay: Duration,
    sink: DiagnosticSink,
    diag: Arc<DiagLog>,
    bind_attempts: AtomicU32,
}

impl DiagnosticListener {
    pub fn new(config: &ListenerConfig, sink: DiagnosticSink, diag: Arc<DiagLog>) -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            sink,
            diag,
            bind_attempts: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.addr.set_ip(ip);
        self
    }

    pub fn bind_attempts(&self) -> u32 {
        self.bind_attempts.load(Ordering::Relaxed)
    }

    /// Bind the port, waiting out `AddrInUse` with a fixed delay. Other bind
    /// errors are returned.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        loop {
            self.bind_attempts.fetch_add(1, Ordering::Relaxed);
            match TcpListener::bind(self.addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    self.diag.error(&format!(
                        "Server port {} in use, retrying in {} seconds",
                        self.addr.port(),
                        self.retry_delay.as_secs()
                    ));
                    tokio::time::sleep(self.retry_delay).await;
                },
                Err(e) => return Err(e),
            }
        }
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .fallback(relay_handler)
            .with_state(Arc::clone(self))
    }

    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = self.bind().await?;
        info!(addr = %listener.local_addr()?, "diagnostic listener ready");
        axum::serve(listener, self.router()).await
    }
}

async fn relay_handler(State(listener): State<Arc<DiagnosticListener>>, body: Bytes) -> Json<Value> {
    let body = String::from_utf8_lossy(&body).into_owned();
    debug!(len = body.len(), "diagnostic listener received body");
    listener.sink.relay(body);
    Json(json!({ "code": 0 }))
}
