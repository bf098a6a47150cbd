use serde::{Deserialize, Serialize};

use crate::turn::{DynamicTurnConfig, StaticIceConfig};

/// Top-level configuration for the signaling broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ice: IceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTPS port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate (auto-generated if absent)
    pub tls_cert: Option<String>,
    /// Path to TLS key (auto-generated if absent)
    pub tls_key: Option<String>,
    /// Path to the viewer page's static files
    #[serde(default = "default_web_root")]
    pub web_root: String,
    /// Directory used to persist an auto-generated TLS cert/key across restarts
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default)]
    pub static_servers: StaticIceConfig,
    #[serde(default)]
    pub dynamic_turn: DynamicTurnConfig,
    /// Maximum TTL to hand back to clients for TURN credentials, in seconds.
    #[serde(default = "default_credential_ttl")]
    pub credential_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            web_root: default_web_root(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            static_servers: StaticIceConfig {
                stun_urls: default_stun_urls(),
                ..Default::default()
            },
            dynamic_turn: DynamicTurnConfig::default(),
            credential_ttl_secs: default_credential_ttl(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ice: IceConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, broker should not start) or
    /// "WARNING:" (advisory, broker can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    issues.push(format!("ERROR: tls_cert '{}' does not exist.", cert));
                }
                if !std::path::Path::new(key).exists() {
                    issues.push(format!("ERROR: tls_key '{}' does not exist.", key));
                }
            }
            (Some(_), None) => {
                issues.push(
                    "WARNING: tls_cert is set but tls_key is not. Both must be set for custom \
                     TLS, or omit both for an auto-generated certificate."
                        .to_string(),
                );
            }
            (None, Some(_)) => {
                issues.push(
                    "WARNING: tls_key is set but tls_cert is not. Both must be set for custom \
                     TLS, or omit both for an auto-generated certificate."
                        .to_string(),
                );
            }
            (None, None) => {}
        }

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        for url in &self.ice.static_servers.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'.",
                    url
                ));
            }
        }

        if let Some(url) = &self.ice.static_servers.turn_url {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'.",
                    url
                ));
            }
        }

        if self.ice.credential_ttl_secs > 24 * 3600 {
            issues.push(format!(
                "WARNING: ice.credential_ttl_secs is {}, clamped to 24h at serving time.",
                self.ice.credential_ttl_secs
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

/// Which GStreamer video source element to build, selected by the operator
/// per the hardware the broadcaster process runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraKind {
    /// Raspberry Pi camera stack using `libcamerasrc` (Pi 4/5 and Camera Module 3).
    PiModern,
    /// Older Raspberry Pi camera stack exposed through `v4l2src`.
    PiLegacy,
    /// Generic USB UVC webcam, also via `v4l2src`.
    Usb,
}

impl std::str::FromStr for CameraKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pi-modern" => Ok(CameraKind::PiModern),
            "pi-legacy" => Ok(CameraKind::PiLegacy),
            "usb" => Ok(CameraKind::Usb),
            other => Err(format!(
                "unknown camera kind '{other}', expected one of: pi-modern, pi-legacy, usb"
            )),
        }
    }
}

/// Process configuration for the broadcaster binary, assembled from CLI
/// arguments and environment variables.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub signaling_url: String,
    pub stream_id: String,
    pub video_device_path: String,
    pub audio_device_path: Option<String>,
    pub camera_kind: CameraKind,
    pub ice: IceConfig,
}

impl BroadcasterConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.signaling_url.is_empty() {
            issues.push("ERROR: signaling_url must not be empty.".to_string());
        } else if !self.signaling_url.starts_with("ws://")
            && !self.signaling_url.starts_with("wss://")
        {
            issues.push(format!(
                "ERROR: signaling_url '{}' must start with 'ws://' or 'wss://'.",
                self.signaling_url
            ));
        }

        if self.stream_id.is_empty() {
            issues.push("ERROR: stream_id must not be empty.".to_string());
        }

        if self.video_device_path.is_empty() {
            issues.push("ERROR: video_device_path must not be empty.".to_string());
        }

        if self.ice.dynamic_turn.endpoint.is_some() && !self.ice.dynamic_turn.is_configured() {
            issues.push(
                "WARNING: dynamic TURN endpoint is set but key_id/api_token are missing; \
                 falling back to static ICE servers."
                    .to_string(),
            );
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_web_root() -> String {
    "web/dist".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/castcore".to_string()
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_credential_ttl() -> u64 {
    3600
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: BrokerConfig =
            toml::from_str("").expect("empty string should deserialize to default config");
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8443);
        assert!(config.server.tls_cert.is_none());
        assert_eq!(config.ice.static_servers.stun_urls.len(), 2);
        assert!(config.ice.static_servers.turn_url.is_none());
        assert_eq!(config.ice.credential_ttl_secs, 3600);
    }

    #[test]
    fn partial_config_only_server_section() {
        let toml_str = r#"
[server]
port = 9443
"#;
        let config: BrokerConfig =
            toml::from_str(toml_str).expect("partial config should deserialize");
        assert_eq!(config.server.port, 9443);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.ice.static_servers.stun_urls.len(), 2);
    }

    fn valid_config() -> BrokerConfig {
        toml::from_str("").expect("default config")
    }

    fn validate_issues(config: &BrokerConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = valid_config();
        config.server.port = 0;
        assert!(has_error(&validate_issues(&config), "port"));
    }

    #[test]
    fn validate_tls_cert_missing_file_is_error() {
        let mut config = valid_config();
        config.server.tls_cert = Some("/nonexistent/cert.pem".to_string());
        config.server.tls_key = Some("/nonexistent/key.pem".to_string());
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "tls_cert"));
        assert!(has_error(&issues, "tls_key"));
    }

    #[test]
    fn validate_tls_cert_without_key_is_warning() {
        let mut config = valid_config();
        config.server.tls_cert = Some("/some/cert.pem".to_string());
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "tls_cert is set but tls_key is not"));
    }

    #[test]
    fn validate_stun_url_bad_prefix_is_error() {
        let mut config = valid_config();
        config.ice.static_servers.stun_urls = vec!["http://stun.example.com:3478".to_string()];
        assert!(has_error(&validate_issues(&config), "STUN URL"));
    }

    #[test]
    fn validate_turn_url_bad_prefix_is_error() {
        let mut config = valid_config();
        config.ice.static_servers.turn_url = Some("http://turn.example.com:3478".to_string());
        assert!(has_error(&validate_issues(&config), "TURN URL"));
    }

    #[test]
    fn validate_ttl_over_24h_is_warning() {
        let mut config = valid_config();
        config.ice.credential_ttl_secs = 48 * 3600;
        assert!(has_warning(&validate_issues(&config), "credential_ttl_secs"));
    }

    #[test]
    fn camera_kind_from_str_roundtrip() {
        assert_eq!("pi-modern".parse::<CameraKind>().unwrap(), CameraKind::PiModern);
        assert_eq!("pi-legacy".parse::<CameraKind>().unwrap(), CameraKind::PiLegacy);
        assert_eq!("usb".parse::<CameraKind>().unwrap(), CameraKind::Usb);
        assert!("webcam".parse::<CameraKind>().is_err());
    }

    fn valid_broadcaster_config() -> BroadcasterConfig {
        BroadcasterConfig {
            signaling_url: "wss://broker.example.com/ws".to_string(),
            stream_id: "s1".to_string(),
            video_device_path: "/dev/video0".to_string(),
            audio_device_path: None,
            camera_kind: CameraKind::Usb,
            ice: IceConfig::default(),
        }
    }

    #[test]
    fn validate_broadcaster_default_passes() {
        assert!(valid_broadcaster_config().validate().is_ok());
    }

    #[test]
    fn validate_broadcaster_bad_signaling_url_scheme_is_error() {
        let mut config = valid_broadcaster_config();
        config.signaling_url = "http://broker.example.com".to_string();
        assert!(has_error(&validate_issues_b(&config), "signaling_url"));
    }

    #[test]
    fn validate_broadcaster_empty_stream_id_is_error() {
        let mut config = valid_broadcaster_config();
        config.stream_id = String::new();
        assert!(has_error(&validate_issues_b(&config), "stream_id"));
    }

    fn validate_issues_b(config: &BroadcasterConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }
}
