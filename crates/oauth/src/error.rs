use thiserror::Error;

/// Errors raised by the OAuth2 session layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid credentials/endpoints. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The vendor rejected a code, credential or refresh-token exchange.
    #[error("authorization failed: {message}")]
    Auth { message: String, code: Option<i64> },

    /// A signed API call returned a non-OK status or a non-zero result code.
    #[error("vendor API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("no client for session {session_id} ({config_id})")]
    NotFound {
        session_id: String,
        config_id: String,
    },

    #[error("a client for session {session_id} ({config_id}) already exists")]
    AlreadyExists {
        session_id: String,
        config_id: String,
    },

    #[error("client is {0}")]
    InvalidState(&'static str),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to parse {context}: {source}")]
    Parse {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("session store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn parse(context: &'static str, source: serde_json::Error) -> Self {
        Self::Parse { context, source }
    }

    /// Message suitable for showing to the user during pairing.
    pub fn user_message(&self) -> String {
        match self {
            Self::Auth { message, .. } | Self::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
