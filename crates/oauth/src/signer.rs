//! Per-request signing for the vendor open API.
//!
//! Every call carries `Appid`, `Keyid`, `Time`, `Nonce` and `Sign` headers,
//! plus `Accesstoken` once the session holds one. `Sign` is the hex MD5 of
//! the lowercased string
//! `Accesstoken=<t>&Appid=<id>&Keyid=<key>&Nonce=<n>&Time=<t><app key>`,
//! with the `Accesstoken=` segment dropped when there is no token.

use std::time::{SystemTime, UNIX_EPOCH};

use {
    hublink_config::RegionConfig,
    md5::{Digest, Md5},
    reqwest::{
        RequestBuilder,
        header::{HeaderMap, HeaderName, HeaderValue},
    },
    secrecy::{ExposeSecret, Secret},
};

use crate::error::{Error, Result};

/// Signing credentials for one region.
#[derive(Clone)]
pub struct RequestSigner {
    app_id: String,
    app_key: Secret<String>,
    key_id: String,
    lang: String,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("app_id", &self.app_id)
            .field("app_key", &"[REDACTED]")
            .field("key_id", &self.key_id)
            .field("lang", &self.lang)
            .finish()
    }
}

/// Headers for a single signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub app_id: String,
    pub access_token: Option<String>,
    pub key_id: String,
    pub time: String,
    pub nonce: String,
    pub sign: String,
    pub lang: String,
}

impl RequestSigner {
    /// Fails with [`Error::Config`] when any credential is missing or empty.
    pub fn new(app_id: &str, app_key: Secret<String>, key_id: &str) -> Result<Self> {
        if app_id.is_empty() {
            return Err(Error::Config("app id is not configured".into()));
        }
        if app_key.expose_secret().is_empty() {
            return Err(Error::Config("app key is not configured".into()));
        }
        if key_id.is_empty() {
            return Err(Error::Config("key id is not configured".into()));
        }
        Ok(Self {
            app_id: app_id.into(),
            app_key,
            key_id: key_id.into(),
            lang: "en".into(),
        })
    }

    pub fn from_region(region: &RegionConfig) -> Result<Self> {
        let app_key = region
            .app_key
            .clone()
            .ok_or_else(|| Error::Config("app key is not configured".into()))?;
        let signer = Self::new(
            region.app_id.as_deref().unwrap_or_default(),
            app_key,
            region.key_id.as_deref().unwrap_or_default(),
        )?;
        Ok(match region.lang.as_deref() {
            Some(lang) if !lang.is_empty() => signer.with_lang(lang),
            _ => signer,
        })
    }

    #[must_use]
    pub fn with_lang(mut self, lang: &str) -> Self {
        self.lang = lang.into();
        self
    }

    /// Sign with the current wall-clock time. The nonce reuses the timestamp.
    pub fn sign(&self, access_token: Option<&str>) -> SignedHeaders {
        self.sign_at(access_token, now_millis())
    }

    pub fn sign_at(&self, access_token: Option<&str>, millis: u64) -> SignedHeaders {
        let access_token = access_token.filter(|t| !t.is_empty());
        let time = millis.to_string();
        let nonce = time.clone();
        let sign = compute_sign(
            access_token,
            &self.app_id,
            &self.key_id,
            &nonce,
            &time,
            self.app_key.expose_secret(),
        );
        SignedHeaders {
            app_id: self.app_id.clone(),
            access_token: access_token.map(str::to_string),
            key_id: self.key_id.clone(),
            time,
            nonce,
            sign,
            lang: self.lang.clone(),
        }
    }
}

/// The lowercased string that gets hashed.
pub fn sign_input(
    access_token: Option<&str>,
    app_id: &str,
    key_id: &str,
    nonce: &str,
    time: &str,
    app_key: &str,
) -> String {
    let mut input = String::new();
    if let Some(token) = access_token.filter(|t| !t.is_empty()) {
        input.push_str("Accesstoken=");
        input.push_str(token);
        input.push('&');
    }
    input.push_str(&format!(
        "Appid={app_id}&Keyid={key_id}&Nonce={nonce}&Time={time}{app_key}"
    ));
    input.to_lowercase()
}

pub fn compute_sign(
    access_token: Option<&str>,
    app_id: &str,
    key_id: &str,
    nonce: &str,
    time: &str,
    app_key: &str,
) -> String {
    let input = sign_input(access_token, app_id, key_id, nonce, time, app_key);
    hex::encode(Md5::digest(input.as_bytes()))
}

impl SignedHeaders {
    pub fn to_header_map(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let mut put = |name: &'static str, value: &str| -> Result<()> {
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("invalid {name} header value: {e}")))?;
            headers.insert(HeaderName::from_static(name), value);
            Ok(())
        };
        put("appid", &self.app_id)?;
        if let Some(token) = &self.access_token {
            put("accesstoken", token)?;
        }
        put("keyid", &self.key_id)?;
        put("time", &self.time)?;
        put("nonce", &self.nonce)?;
        put("sign", &self.sign)?;
        put("lang", &self.lang)?;
        Ok(headers)
    }

    pub fn apply(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        Ok(request.headers(self.to_header_map()?))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> RequestSigner {
        RequestSigner::new("AppID1", Secret::new("AppKEY".into()), "K.1").unwrap()
    }

    #[test]
    fn input_includes_access_token_segment() {
        assert_eq!(
            sign_input(Some("TOKEN"), "AppID1", "K.1", "100", "100", "KEY"),
            "accesstoken=token&appid=appid1&keyid=k.1&nonce=100&time=100key"
        );
    }

    #[test]
    fn input_omits_absent_or_empty_token() {
        let expected = "appid=appid1&keyid=k.1&nonce=100&time=100key";
        assert_eq!(sign_input(None, "AppID1", "K.1", "100", "100", "KEY"), expected);
        assert_eq!(sign_input(Some(""), "AppID1", "K.1", "100", "100", "KEY"), expected);
    }

    #[test]
    fn sign_is_md5_hex_of_input() {
        // md5("appid=a&keyid=k&nonce=1&time=1s")
        let sign = compute_sign(None, "a", "k", "1", "1", "s");
        assert_eq!(sign.len(), 32);
        assert_eq!(
            sign,
            hex::encode(Md5::digest(b"appid=a&keyid=k&nonce=1&time=1s"))
        );
    }

    #[test]
    fn signature_is_deterministic_and_input_sensitive() {
        let base = compute_sign(Some("T"), "a", "k", "1", "2", "s");
        assert_eq!(base, compute_sign(Some("T"), "a", "k", "1", "2", "s"));
        assert_ne!(base, compute_sign(Some("U"), "a", "k", "1", "2", "s"));
        assert_ne!(base, compute_sign(Some("T"), "b", "k", "1", "2", "s"));
        assert_ne!(base, compute_sign(Some("T"), "a", "j", "1", "2", "s"));
        assert_ne!(base, compute_sign(Some("T"), "a", "k", "3", "2", "s"));
        assert_ne!(base, compute_sign(Some("T"), "a", "k", "1", "3", "s"));
        assert_ne!(base, compute_sign(Some("T"), "a", "k", "1", "2", "t"));
    }

    #[test]
    fn nonce_reuses_timestamp() {
        let headers = signer().sign_at(Some("T1"), 1_700_000_000_123);
        assert_eq!(headers.time, "1700000000123");
        assert_eq!(headers.nonce, headers.time);
        assert_eq!(headers.access_token.as_deref(), Some("T1"));
        assert_eq!(headers.lang, "en");
    }

    #[test]
    fn header_map_skips_missing_token() {
        let map = signer().sign_at(None, 5).to_header_map().unwrap();
        assert!(map.get("accesstoken").is_none());
        assert_eq!(map.get("appid").unwrap(), "AppID1");
        assert_eq!(map.get("keyid").unwrap(), "K.1");
        assert!(map.get("sign").is_some());
    }

    #[test]
    fn missing_credentials_fail_fast() {
        assert!(matches!(
            RequestSigner::new("", Secret::new("k".into()), "id"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RequestSigner::new("a", Secret::new(String::new()), "id"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RequestSigner::from_region(&RegionConfig {
                app_id: Some("a".into()),
                key_id: Some("k".into()),
                ..Default::default()
            }),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn debug_redacts_app_key() {
        let out = format!("{:?}", signer());
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains("AppKEY"));
    }
}
