//! Connection and plugin configuration

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::warn;
use vcloud_common::{Error, Result};

/// Deprecated `client_config` keys and the keys that replaced them.
const KEY_ALIASES: [(&str, &str); 3] = [
    ("username", "user"),
    ("ssl_verify", "verify_ssl_certs"),
    ("url", "uri"),
];

/// Credentials every connection needs.
pub const CREDENTIAL_KEYS: [&str; 3] = ["user", "password", "org"];

const DEFAULT_URI: &str = "https://vcd.example.com";

/// Connection parameters resolved from a node's `client_config` property
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub uri: Option<String>,
    pub api_version: Option<String>,
    pub verify_ssl_certs: Option<bool>,
    pub log_file: Option<String>,
    pub log_requests: Option<bool>,
    pub log_headers: Option<bool>,
    pub log_bodies: Option<bool>,
    #[serde(default)]
    pub configuration_kwargs: Map<String, Value>,

    pub user: String,
    pub password: String,
    pub org: String,
    #[serde(default)]
    pub credentials_kwargs: Map<String, Value>,

    pub vdc: Option<String>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("uri", &self.uri)
            .field("api_version", &self.api_version)
            .field("verify_ssl_certs", &self.verify_ssl_certs)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("org", &self.org)
            .field("vdc", &self.vdc)
            .finish()
    }
}

impl ClientConfig {
    /// Parse the `client_config` node property.
    ///
    /// Deprecated keys are accepted with a warning. A missing credential is a
    /// configuration error, raised before anything talks to the provider.
    pub fn from_properties(node_properties: &Map<String, Value>) -> Result<Self> {
        let mut raw = node_properties
            .get("client_config")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        for (old, new) in KEY_ALIASES {
            if let Some(value) = raw.remove(old) {
                warn!(
                    "The client_config key \"{}\" is deprecated, use \"{}\" instead.",
                    old, new
                );
                raw.entry(new.to_string()).or_insert(value);
            }
        }

        let credential = |key: &str| -> Result<String> {
            match raw.get(key) {
                Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
                _ => Err(Error::MissingConfigKey(key.to_string())),
            }
        };
        let user = credential("user")?;
        let password = credential("password")?;
        let org = credential("org")?;

        let string = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);
        let boolean = |key: &str| raw.get(key).and_then(Value::as_bool);
        let kwargs = |key: &str| {
            raw.get(key)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default()
        };

        Ok(Self {
            uri: string("uri"),
            api_version: string("api_version"),
            verify_ssl_certs: boolean("verify_ssl_certs"),
            log_file: string("log_file"),
            log_requests: boolean("log_requests"),
            log_headers: boolean("log_headers"),
            log_bodies: boolean("log_bodies"),
            configuration_kwargs: kwargs("configuration_kwargs"),
            user,
            password,
            org,
            credentials_kwargs: kwargs("credentials_kwargs"),
            vdc: string("vdc"),
        })
    }

    pub fn uri_or_default(&self) -> &str {
        self.uri.as_deref().unwrap_or(DEFAULT_URI)
    }
}

/// Plugin-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Bounded wait for one task poll cycle, in seconds
    pub poll_timeout_secs: u64,

    /// Verbs for which a missing remote resource is an acceptable outcome
    pub not_found_ok: Vec<String>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 10,
            not_found_ok: vec!["unlink".to_string(), "delete".to_string(), "stop".to_string()],
        }
    }
}

impl PluginConfig {
    /// Load configuration from file, falling back to defaults
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self =
                toml::from_str(&content).map_err(|e| Error::InvalidConfig(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn is_not_found_ok(&self, verb: &str) -> bool {
        self.not_found_ok.iter().any(|v| v == verb)
    }
}
