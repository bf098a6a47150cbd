use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One entry of the `iceServers` array handed to a WebRTC peer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerEntry {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Static ICE server configuration, read from a config file or env vars.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticIceConfig {
    #[serde(default)]
    pub stun_urls: Vec<String>,
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,
}

/// Dynamic TURN provider configuration: a third-party endpoint that mints
/// short-lived credentials given a key id and API token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicTurnConfig {
    pub endpoint: Option<String>,
    pub key_id: Option<String>,
    pub api_token: Option<String>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for DynamicTurnConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            key_id: None,
            api_token: None,
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    3600
}

impl DynamicTurnConfig {
    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some() && self.key_id.is_some() && self.api_token.is_some()
    }
}

/// Tolerates both response shapes observed from third-party TURN credential
/// providers: `urls` as a bare string, or as a list of strings.
#[derive(Debug, Clone, Deserialize)]
struct RawTurnResponse {
    #[serde(deserialize_with = "deserialize_urls")]
    urls: Vec<String>,
    username: Option<String>,
    #[serde(alias = "password")]
    credential: Option<String>,
}

fn deserialize_urls<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => Ok(vec![s]),
        OneOrMany::Many(v) => Ok(v),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TurnCredentialError {
    #[error("dynamic TURN provider not configured")]
    NotConfigured,
    #[error("request to TURN credential provider failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Fetch short-lived TURN credentials from the configured dynamic provider.
///
/// Never returns a hard error on a failed HTTP call; the caller degrades to
/// STUN-only in that case. Returns `Err(NotConfigured)` only when no endpoint
/// was set at all, so the caller can distinguish "nothing configured" from
/// "configured but unreachable".
pub async fn fetch_dynamic_credentials(
    client: &reqwest::Client,
    cfg: &DynamicTurnConfig,
) -> Result<Option<IceServerEntry>, TurnCredentialError> {
    if !cfg.is_configured() {
        return Err(TurnCredentialError::NotConfigured);
    }
    let endpoint = cfg.endpoint.as_ref().unwrap();
    let ttl = cfg.ttl_secs.min(24 * 3600);

    let response = client
        .post(endpoint)
        .timeout(Duration::from_secs(5))
        .json(&serde_json::json!({
            "keyId": cfg.key_id,
            "apiToken": cfg.api_token,
            "ttl": ttl,
        }))
        .send()
        .await;

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "dynamic TURN credential request failed, falling back to STUN-only");
            return Ok(None);
        }
    };

    if !response.status().is_success() {
        tracing::warn!(status = %response.status(), "dynamic TURN credential provider returned non-success");
        return Ok(None);
    }

    match response.json::<RawTurnResponse>().await {
        Ok(raw) => Ok(Some(IceServerEntry {
            urls: raw.urls,
            username: raw.username,
            credential: raw.credential,
        })),
        Err(e) => {
            tracing::warn!(error = %e, "dynamic TURN credential response could not be parsed");
            Ok(None)
        }
    }
}

/// Merge static and dynamic ICE configuration. Dynamic TURN credentials, when
/// available, replace the static TURN entry; STUN servers are always kept.
pub fn build_ice_servers(
    static_cfg: &StaticIceConfig,
    dynamic: Option<IceServerEntry>,
) -> Vec<IceServerEntry> {
    let mut servers = Vec::new();

    if !static_cfg.stun_urls.is_empty() {
        servers.push(IceServerEntry {
            urls: static_cfg.stun_urls.clone(),
            username: None,
            credential: None,
        });
    }

    match dynamic {
        Some(entry) => servers.push(entry),
        None => {
            if let Some(turn_url) = &static_cfg.turn_url {
                servers.push(IceServerEntry {
                    urls: vec![turn_url.clone()],
                    username: static_cfg.turn_username.clone(),
                    credential: static_cfg.turn_password.clone(),
                });
            }
        }
    }

    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_as_string_deserializes_to_single_entry_vec() {
        let raw: RawTurnResponse = serde_json::from_str(
            r#"{"urls":"turn:turn.example.com:3478","username":"u","credential":"p"}"#,
        )
        .unwrap();
        assert_eq!(raw.urls, vec!["turn:turn.example.com:3478".to_string()]);
    }

    #[test]
    fn urls_as_list_deserializes_unchanged() {
        let raw: RawTurnResponse = serde_json::from_str(
            r#"{"urls":["turn:a.example.com:3478","turn:b.example.com:3478"],"username":"u","credential":"p"}"#,
        )
        .unwrap();
        assert_eq!(raw.urls.len(), 2);
    }

    #[test]
    fn password_alias_maps_to_credential() {
        let raw: RawTurnResponse =
            serde_json::from_str(r#"{"urls":"turn:x:3478","password":"secret"}"#).unwrap();
        assert_eq!(raw.credential.as_deref(), Some("secret"));
    }

    #[test]
    fn build_ice_servers_prefers_dynamic_over_static_turn() {
        let static_cfg = StaticIceConfig {
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_url: Some("turn:static.example.com:3478".to_string()),
            turn_username: Some("static-user".to_string()),
            turn_password: Some("static-pass".to_string()),
        };
        let dynamic = IceServerEntry {
            urls: vec!["turn:dynamic.example.com:3478".to_string()],
            username: Some("dyn-user".to_string()),
            credential: Some("dyn-pass".to_string()),
        };
        let servers = build_ice_servers(&static_cfg, Some(dynamic));
        assert_eq!(servers.len(), 2);
        assert!(servers[1].urls[0].contains("dynamic.example.com"));
    }

    #[test]
    fn build_ice_servers_falls_back_to_static_turn_when_dynamic_absent() {
        let static_cfg = StaticIceConfig {
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_url: Some("turn:static.example.com:3478".to_string()),
            turn_username: Some("static-user".to_string()),
            turn_password: Some("static-pass".to_string()),
        };
        let servers = build_ice_servers(&static_cfg, None);
        assert_eq!(servers.len(), 2);
        assert!(servers[1].urls[0].contains("static.example.com"));
    }

    #[test]
    fn build_ice_servers_stun_only_when_nothing_else_configured() {
        let static_cfg = StaticIceConfig {
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            ..Default::default()
        };
        let servers = build_ice_servers(&static_cfg, None);
        assert_eq!(servers.len(), 1);
    }

    #[test]
    fn dynamic_config_not_configured_without_all_three_fields() {
        let cfg = DynamicTurnConfig {
            endpoint: Some("https://turn.example.com/creds".to_string()),
            key_id: None,
            api_token: None,
            ttl_secs: 3600,
        };
        assert!(!cfg.is_configured());
    }
}
