//! The OAuth2 token value object.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tokens for one vendor session.
///
/// Empty strings and a zero lifetime are stored as absent values, so a
/// token loaded from storage compares equal to the one that was saved.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TokenFields")]
pub struct OAuth2Token {
    access_token: Option<String>,
    refresh_token: Option<String>,
    token_type: Option<String>,
    /// Lifetime in seconds as reported at issue time.
    expires_in: Option<u64>,
    /// Vendor account id used to route webhook events.
    #[serde(rename = "openId")]
    open_id: Option<String>,
}

impl OAuth2Token {
    pub fn new(
        access_token: Option<String>,
        refresh_token: Option<String>,
        token_type: Option<String>,
        expires_in: Option<u64>,
        open_id: Option<String>,
    ) -> Self {
        Self {
            access_token: non_empty(access_token),
            refresh_token: non_empty(refresh_token),
            token_type: non_empty(token_type),
            expires_in: expires_in.filter(|secs| *secs > 0),
            open_id: non_empty(open_id),
        }
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_token.is_some()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn token_type(&self) -> Option<&str> {
        self.token_type.as_deref()
    }

    pub fn expires_in(&self) -> Option<u64> {
        self.expires_in
    }

    pub fn external_identity(&self) -> Option<&str> {
        self.open_id.as_deref()
    }

    /// Keep `open_id` when this token does not name an account itself.
    pub fn or_identity(mut self, open_id: Option<String>) -> Self {
        if self.open_id.is_none() {
            self.open_id = non_empty(open_id);
        }
        self
    }
}

impl fmt::Debug for OAuth2Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("OAuth2Token")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("open_id", &self.open_id)
            .finish()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Accepts both the stored snake_case layout and the vendor's camelCase
/// token payloads; `expires_in` may arrive as a number or a numeric string.
#[derive(Deserialize)]
struct TokenFields {
    #[serde(default, alias = "accessToken")]
    access_token: Option<String>,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(default, alias = "tokenType")]
    token_type: Option<String>,
    #[serde(default, alias = "expiresIn")]
    expires_in: Option<serde_json::Value>,
    #[serde(default, rename = "openId", alias = "open_id", alias = "openid")]
    open_id: Option<String>,
}

impl From<TokenFields> for OAuth2Token {
    fn from(raw: TokenFields) -> Self {
        let expires_in = raw.expires_in.and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        Self::new(
            raw.access_token,
            raw.refresh_token,
            raw.token_type,
            expires_in,
            raw.open_id,
        )
    }
}
