//! Proxy daemon configuration and persisted install settings.
//!
//! The proxy daemon reads its configuration once at startup, so a changed
//! identity only takes effect after the daemon is restarted.
use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    constants::{EARLY_DATA_HEADER, LISTEN_ADDRESS, MAX_EARLY_DATA},
    error::ConfigError,
    runtime::write_atomic,
    tunnel::TunnelMode,
};

/// Parameters the proxy daemon configuration is rendered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    identity: String,
    listen_port: u16,
    transport_path: String,
}

impl ServiceConfig {
    /// Validates `identity` and `listen_port` and derives the transport path.
    pub fn new(identity: impl Into<String>, listen_port: u16) -> Result<Self, ConfigError> {
        let identity = identity.into();
        validate_identity(&identity)?;
        if listen_port == 0 {
            return Err(ConfigError::Invalid("listen port must be non-zero".into()));
        }

        Ok(Self {
            transport_path: transport_path(&identity),
            identity,
            listen_port,
        })
    }

    /// Identity token clients authenticate with.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Loopback port the proxy daemon listens on.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Websocket path, always `/` followed by the identity.
    pub fn transport_path(&self) -> &str {
        &self.transport_path
    }

    /// Renders the daemon configuration for these parameters.
    pub fn render(&self) -> ConfigArtifact {
        render(&self.identity, self.listen_port)
    }
}

fn transport_path(identity: &str) -> String {
    format!("/{identity}")
}

/// Accepts UUID-shaped tokens: ASCII alphanumerics and dashes.
pub fn validate_identity(identity: &str) -> Result<(), ConfigError> {
    if identity.is_empty() {
        return Err(ConfigError::Invalid("identity must not be empty".into()));
    }
    if !identity
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Invalid(format!(
            "identity '{identity}' may only contain letters, digits and '-'"
        )));
    }
    Ok(())
}

/// Generates a fresh random identity.
pub fn generate_identity() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Proxy daemon configuration document.
///
/// Field names are dictated by the daemon's parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigArtifact {
    pub log: LogSettings,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    pub loglevel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    pub port: u16,
    pub listen: String,
    pub protocol: String,
    pub settings: InboundSettings,
    pub stream_settings: StreamSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundSettings {
    pub clients: Vec<Client>,
    pub decryption: String,
}

/// One entry of the identity list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub flow: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub ws_settings: WsSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsSettings {
    pub path: String,
    pub max_early_data: u32,
    pub early_data_header_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    pub protocol: String,
    pub tag: String,
}

impl ConfigArtifact {
    /// Websocket path the daemon routes on.
    pub fn transport_path(&self) -> Option<&str> {
        self.inbounds
            .first()
            .map(|inbound| inbound.stream_settings.ws_settings.path.as_str())
    }

    /// Serializes the document as pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Atomically replaces the artifact at `path`.
    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        let json = self.to_json().map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomic(path, json.as_bytes()).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Wrote proxy configuration to {}", path.display());
        Ok(())
    }

    /// Reads an artifact previously written with [`ConfigArtifact::write_to`].
    pub fn read_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Renders the proxy daemon configuration. Pure: equal inputs give equal documents.
pub fn render(identity: &str, listen_port: u16) -> ConfigArtifact {
    ConfigArtifact {
        log: LogSettings {
            loglevel: "none".into(),
        },
        inbounds: vec![Inbound {
            port: listen_port,
            listen: LISTEN_ADDRESS.into(),
            protocol: "vless".into(),
            settings: InboundSettings {
                clients: vec![Client {
                    id: identity.into(),
                    flow: String::new(),
                }],
                decryption: "none".into(),
            },
            stream_settings: StreamSettings {
                network: "ws".into(),
                ws_settings: WsSettings {
                    path: transport_path(identity),
                    max_early_data: MAX_EARLY_DATA,
                    early_data_header_name: EARLY_DATA_HEADER.into(),
                },
            },
        }],
        outbounds: vec![Outbound {
            protocol: "freedom".into(),
            tag: "direct".into(),
        }],
    }
}

/// Settings recorded by `install` and reused by `restart` and `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSettings {
    pub identity: String,
    pub listen_port: u16,
    pub tunnel_mode: TunnelMode,
    pub installed_at: DateTime<Utc>,
}

impl InstallSettings {
    /// Rebuilds the validated service configuration.
    pub fn service_config(&self) -> Result<ServiceConfig, ConfigError> {
        ServiceConfig::new(self.identity.clone(), self.listen_port)
    }

    /// Loads settings from `path`; `None` when nothing was installed.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(settings))
    }

    /// Loads settings or fails with [`ConfigError::MissingInstall`].
    pub fn require(path: &Path) -> Result<Self, ConfigError> {
        Self::load(path)?.ok_or(ConfigError::MissingInstall)
    }

    /// Atomically writes settings to `path`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomic(path, json.as_bytes()).map_err(|source| ConfigError::Io {
            path: PathBuf::from(path),
            source,
        })
    }
}
