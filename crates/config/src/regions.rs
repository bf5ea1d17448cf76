use std::collections::HashMap;

use secrecy::Secret;

use crate::schema::{HublinkConfig, RegionConfig};

/// Vendor open-API hosts per region.
const REGION_HOSTS: &[(&str, &str)] = &[
    ("china", "open-cn.aqara.com"),
    ("europe", "open-ger.aqara.com"),
    ("usa", "open-usa.aqara.com"),
    ("korea", "open-kr.aqara.com"),
    ("russia", "open-ru.aqara.com"),
    ("singapore", "open-sg.aqara.com"),
];

const DEFAULT_REDIRECT_URL: &str = "https://callback.athom.com/oauth2/callback";

fn builtin_regions() -> HashMap<String, RegionConfig> {
    REGION_HOSTS
        .iter()
        .map(|(id, host)| {
            let base = format!("https://{host}/v3.0/open");
            ((*id).to_string(), RegionConfig {
                api_url: Some(format!("{base}/api")),
                token_url: Some(format!("{base}/access_token")),
                authorization_url: Some(format!("{base}/authorize")),
                redirect_url: Some(DEFAULT_REDIRECT_URL.into()),
                scopes: Some(Vec::new()),
                lang: Some("en".into()),
                ..Default::default()
            })
        })
        .collect()
}

/// Resolve the effective settings for a region.
///
/// Priority:
/// 1. Environment variables (`HUBLINK_{REGION}_APP_ID`, `_APP_KEY`, `_KEY_ID`)
/// 2. The `[regions.<id>]` section of the config file
/// 3. Built-in endpoint defaults
///
/// Returns `None` for a region that is neither built in nor configured.
pub fn resolve_region(config: &HublinkConfig, config_id: &str) -> Option<RegionConfig> {
    resolve_region_with(config, config_id, |name| std::env::var(name).ok())
}

fn resolve_region_with(
    config: &HublinkConfig,
    config_id: &str,
    env: impl Fn(&str) -> Option<String>,
) -> Option<RegionConfig> {
    let builtin = builtin_regions().remove(config_id);
    let configured = config.regions.get(config_id).cloned();

    let mut region = match (configured, builtin) {
        (Some(c), Some(b)) => c.layered_over(b),
        (Some(c), None) => c,
        (None, Some(b)) => b,
        (None, None) => return None,
    };

    let prefix = format!("HUBLINK_{}_", config_id.to_uppercase().replace('-', "_"));
    if let Some(v) = env(&format!("{prefix}APP_ID")) {
        region.app_id = Some(v);
    }
    if let Some(v) = env(&format!("{prefix}APP_KEY")) {
        region.app_key = Some(Secret::new(v));
    }
    if let Some(v) = env(&format!("{prefix}KEY_ID")) {
        region.key_id = Some(v);
    }

    Some(region)
}

/// Ids of every known region, built-in and configured, sorted.
pub fn region_ids(config: &HublinkConfig) -> Vec<String> {
    let mut ids: Vec<String> = builtin_regions()
        .into_keys()
        .chain(config.regions.keys().cloned())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret};

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn builtin_region_has_endpoints_but_no_credentials() {
        let region = resolve_region_with(&HublinkConfig::default(), "europe", no_env).unwrap();
        assert_eq!(
            region.api_url.as_deref(),
            Some("https://open-ger.aqara.com/v3.0/open/api")
        );
        assert!(region.app_id.is_none());
        assert!(region.app_key.is_none());
    }

    #[test]
    fn unknown_region_is_none() {
        assert!(resolve_region_with(&HublinkConfig::default(), "mars", no_env).is_none());
    }

    #[test]
    fn env_overrides_config_file() {
        let mut config = HublinkConfig::default();
        config.regions.insert("china".into(), RegionConfig {
            app_id: Some("from-file".into()),
            key_id: Some("K-file".into()),
            ..Default::default()
        });
        let env = |name: &str| match name {
            "HUBLINK_CHINA_APP_ID" => Some("from-env".to_string()),
            "HUBLINK_CHINA_APP_KEY" => Some("secret".to_string()),
            _ => None,
        };
        let region = resolve_region_with(&config, "china", env).unwrap();
        assert_eq!(region.app_id.as_deref(), Some("from-env"));
        assert_eq!(region.key_id.as_deref(), Some("K-file"));
        assert_eq!(region.app_key.unwrap().expose_secret(), "secret");
        assert!(region.token_url.is_some());
    }

    #[test]
    fn custom_region_is_listed() {
        let mut config = HublinkConfig::default();
        config
            .regions
            .insert("staging".into(), RegionConfig::default());
        let ids = region_ids(&config);
        assert!(ids.contains(&"staging".to_string()));
        assert!(ids.contains(&"usa".to_string()));
    }
}
