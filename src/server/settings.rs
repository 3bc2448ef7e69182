use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub tls: TlsSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RegistrySettings {
    /// AWS account ID of the pull-through cache registry (e.g. "123456789012")
    #[serde(default)]
    pub account_id: String,
    /// AWS region of the pull-through cache registry (e.g. "us-east-1")
    #[serde(default)]
    pub region: String,
    /// Ordered list of source registry prefixes to mirror.
    /// Empty means Docker Hub only.
    #[serde(default)]
    pub registries: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsSettings {
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
        }
    }
}

fn default_cert_path() -> String {
    "/etc/webhook/certs/tls.crt".to_string()
}

fn default_key_path() -> String {
    "/etc/webhook/certs/tls.key".to_string()
}

impl Settings {
    /// Load settings from an optional `default` config file in the config
    /// directory, layered with `WEBHOOK__`-prefixed environment variables
    /// (e.g. `WEBHOOK__REGISTRY__ACCOUNT_ID`,
    /// `WEBHOOK__REGISTRY__REGISTRIES=ghcr.io,docker.io`).
    pub fn new(config_dir: Option<&str>) -> Result<Self, ConfigError> {
        let config_dir = config_dir
            .map(str::to_owned)
            .or_else(|| env::var("WEBHOOK_CONFIG_DIR").ok())
            .unwrap_or_else(|| "config".into());

        let config = Config::builder()
            .add_source(File::with_name(&format!("{config_dir}/default")).required(false))
            .add_source(
                Environment::with_prefix("WEBHOOK")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("registry.registries")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;

        // Special handling for the bare ECR_* environment variables (the
        // convention used by existing deployments of this webhook). These
        // take precedence over both the config file and WEBHOOK__* vars.
        if let Ok(account_id) = env::var("ECR_AWS_ACCOUNT_ID") {
            if !account_id.is_empty() {
                settings.registry.account_id = account_id;
            }
        }
        if let Ok(region) = env::var("ECR_AWS_REGION") {
            if !region.is_empty() {
                settings.registry.region = region;
            }
        }
        if let Ok(raw) = env::var("ECR_REGISTRIES") {
            if !raw.is_empty() {
                settings.registry.registries = raw.split(',').map(str::to_owned).collect();
            }
        }

        settings.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.registry.account_id.trim().is_empty() {
            return Err(ConfigError::Message(
                "registry.account_id is required (or set ECR_AWS_ACCOUNT_ID)".to_string(),
            ));
        }
        if self.registry.region.trim().is_empty() {
            return Err(ConfigError::Message(
                "registry.region is required (or set ECR_AWS_REGION)".to_string(),
            ));
        }
        Ok(self)
    }
}
