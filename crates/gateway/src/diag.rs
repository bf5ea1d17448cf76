//! Rolling diagnostic log and the outbound diagnostic sink.

use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};

use {
    chrono::{SecondsFormat, Utc},
    hublink_config::DiagnosticsConfig,
    tracing::{debug, error, info, warn},
};

/// In-memory log capped at `max_len` characters; the oldest text is trimmed.
///
/// Errors are always recorded. Informational entries only while logging is
/// enabled. Every entry is also emitted through `tracing`.
#[derive(Debug)]
pub struct DiagLog {
    buffer: Mutex<String>,
    max_len: usize,
    enabled: AtomicBool,
}

impl DiagLog {
    pub fn new(config: &DiagnosticsConfig) -> Self {
        Self {
            buffer: Mutex::new(String::new()),
            max_len: config.max_len,
            enabled: AtomicBool::new(config.log_enabled),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn info(&self, message: &str) {
        info!("{message}");
        if self.is_enabled() {
            self.append(message);
        }
    }

    pub fn error(&self, message: &str) {
        error!("{message}");
        self.append(message);
    }

    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.buffer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    fn append(&self, message: &str) {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        buffer.push_str("\r\n* ");
        buffer.push_str(&stamp);
        buffer.push_str("\r\n");
        buffer.push_str(message);
        buffer.push_str("\r\n");

        let len = buffer.chars().count();
        if len > self.max_len {
            let cut = buffer
                .char_indices()
                .nth(len - self.max_len)
                .map_or(buffer.len(), |(i, _)| i);
            buffer.drain(..cut);
        }
    }
}

/// Fire-and-forget relay of raw text to an external endpoint.
#[derive(Debug, Clone)]
pub struct DiagnosticSink {
    http: reqwest::Client,
    url: Option<String>,
}

impl DiagnosticSink {
    pub fn new(http: reqwest::Client, url: Option<String>) -> Self {
        Self { http, url }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    /// POST `body` and return the response text.
    pub async fn post(&self, body: String) -> reqwest::Result<Option<String>> {
        let Some(url) = &self.url else {
            return Ok(None);
        };
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        Ok(Some(response.text().await?))
    }

    /// Relay in the background; the reply is logged and otherwise ignored.
    pub fn relay(&self, body: String) {
        if !self.is_configured() {
            debug!(len = body.len(), "no diagnostic sink configured, dropping body");
            return;
        }
        let sink = self.clone();
        tokio::spawn(async move {
            match sink.post(body).await {
                Ok(reply) => debug!(reply = %reply.unwrap_or_default(), "diagnostic sink replied"),
                Err(e) => warn!(error = %e, "diagnostic sink unreachable"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use {super::*, mockito::Server};

    fn log(max_len: usize, log_enabled: bool) -> DiagLog {
        DiagLog::new(&DiagnosticsConfig {
            log_enabled,
            sink_url: None,
            max_len,
        })
    }

    #[test]
    fn entry_layout() {
        let log = log(60_000, true);
        log.info("hello");
        let text = log.contents();
        assert!(text.starts_with("\r\n* "));
        assert!(text.ends_with("\r\nhello\r\n"));
    }

    #[test]
    fn info_needs_enabled_but_errors_always_land() {
        let log = log(60_000, false);
        log.info("quiet");
        assert!(log.contents().is_empty());
        log.error("loud");
        assert!(log.contents().contains("loud"));

        log.set_enabled(true);
        log.info("now visible");
        assert!(log.contents().contains("now visible"));
    }

    #[test]
    fn oldest_text_is_trimmed() {
        let log = log(100, true);
        for i in 0..20 {
            log.error(&format!("entry number {i}"));
        }
        let text = log.contents();
        assert_eq!(text.chars().count(), 100);
        assert!(text.ends_with("entry number 19\r\n"));
        assert!(!text.contains("entry number 0\r\n"));
    }

    #[test]
    fn trimming_respects_char_boundaries() {
        let log = log(40, true);
        log.error("ééééééééééééééééééééééééé");
        assert_eq!(log.contents().chars().count(), 40);
    }

    #[tokio::test]
    async fn sink_posts_raw_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest")
            .match_body("{\"raw\":true}")
            .with_body("ok")
            .create_async()
            .await;
        let sink = DiagnosticSink::new(
            reqwest::Client::new(),
            Some(format!("{}/ingest", server.url())),
        );
        let reply = sink.post("{\"raw\":true}".into()).await.unwrap();
        assert_eq!(reply.as_deref(), Some("ok"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unconfigured_sink_is_a_no_op() {
        let sink = DiagnosticSink::new(reqwest::Client::new(), None);
        assert!(sink.post("x".into()).await.unwrap().is_none());
    }
}
