//! Tunnel binding and the command lines of both managed services.
use std::{
    fmt, fs,
    io::{ErrorKind, Write},
    os::unix::fs::OpenOptionsExt,
    path::Path,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    constants::CREDENTIAL_FILE_MODE,
    error::ConfigError,
    launcher::ServiceCommand,
    runtime::{RuntimeLayout, write_atomic},
};

/// How the tunnel obtains its public hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelMode {
    /// Hostname is assigned at runtime and discovered from the tunnel log.
    Ephemeral,
    /// Hostname is supplied by the operator and bound to a credential.
    Fixed,
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelMode::Ephemeral => f.write_str("ephemeral"),
            TunnelMode::Fixed => f.write_str("fixed"),
        }
    }
}

/// Opaque tunnel credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wraps a token, rejecting blank values.
    pub fn new(token: impl Into<String>) -> Result<Self, ConfigError> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(ConfigError::Invalid("tunnel token must not be empty".into()));
        }
        Ok(Self(token))
    }

    /// The raw token.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Tunnel configuration for one install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelBinding {
    mode: TunnelMode,
    credential: Option<Credential>,
    hostname: Option<String>,
    discovered: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedBinding {
    hostname: String,
}

impl TunnelBinding {
    /// Ephemeral binding with the hostname still unknown.
    pub fn ephemeral() -> Self {
        Self {
            mode: TunnelMode::Ephemeral,
            credential: None,
            hostname: None,
            discovered: false,
        }
    }

    /// Fixed binding with an operator supplied credential and hostname.
    pub fn fixed(credential: Credential, hostname: impl Into<String>) -> Result<Self, ConfigError> {
        let hostname = normalize_hostname(&hostname.into())?;
        Ok(Self {
            mode: TunnelMode::Fixed,
            credential: Some(credential),
            hostname: Some(hostname),
            discovered: false,
        })
    }

    /// Binding mode.
    pub fn mode(&self) -> TunnelMode {
        self.mode
    }

    /// Credential, present iff the binding is fixed.
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Public hostname, when known.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Whether the hostname came from the tunnel log.
    pub fn discovered(&self) -> bool {
        self.discovered
    }

    /// Records a hostname discovered from the tunnel log.
    pub fn record_discovery(&mut self, hostname: String) {
        self.hostname = Some(hostname);
        self.discovered = true;
    }

    /// Persists a fixed binding; an ephemeral binding removes any stale fixed one.
    pub fn save(&self, layout: &RuntimeLayout) -> Result<(), ConfigError> {
        match (&self.credential, &self.hostname) {
            (Some(credential), Some(hostname)) if self.mode == TunnelMode::Fixed => {
                write_credential(&layout.tunnel_token(), credential)?;
                let json = serde_json::to_string_pretty(&PersistedBinding {
                    hostname: hostname.clone(),
                })
                .map_err(|source| ConfigError::Json {
                    path: layout.tunnel_binding(),
                    source,
                })?;
                write_atomic(&layout.tunnel_binding(), json.as_bytes()).map_err(|source| {
                    ConfigError::Io {
                        path: layout.tunnel_binding(),
                        source,
                    }
                })?;
                debug!("Persisted fixed tunnel binding for {hostname}");
                Ok(())
            }
            _ => {
                remove_if_exists(&layout.tunnel_token())?;
                remove_if_exists(&layout.tunnel_binding())
            }
        }
    }

    /// Loads the binding for `mode` from persisted state.
    pub fn load(layout: &RuntimeLayout, mode: TunnelMode) -> Result<Self, ConfigError> {
        match mode {
            TunnelMode::Ephemeral => Ok(Self::ephemeral()),
            TunnelMode::Fixed => {
                let binding_path = layout.tunnel_binding();
                let contents = fs::read_to_string(&binding_path).map_err(|source| {
                    ConfigError::Io {
                        path: binding_path.clone(),
                        source,
                    }
                })?;
                let persisted: PersistedBinding =
                    serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
                        path: binding_path.clone(),
                        source,
                    })?;

                let token_path = layout.tunnel_token();
                let token = fs::read_to_string(&token_path).map_err(|source| ConfigError::Io {
                    path: token_path.clone(),
                    source,
                })?;
                Self::fixed(Credential::new(token)?, persisted.hostname)
            }
        }
    }
}

/// Lowercases and strips a scheme or trailing slash from an operator supplied hostname.
pub fn normalize_hostname(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let hostname = without_scheme.trim_end_matches('/').to_ascii_lowercase();

    let valid = !hostname.is_empty()
        && hostname.contains('.')
        && hostname.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if !valid {
        return Err(ConfigError::Invalid(format!(
            "'{raw}' is not a valid hostname"
        )));
    }
    Ok(hostname)
}

/// Writes the credential to a private sibling temp file and renames it into place,
/// so a crash never leaves a truncated token behind.
fn write_credential(path: &Path, credential: &Credential) -> Result<(), ConfigError> {
    let io_error = |source: std::io::Error| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{file_name}.tmp"));
    remove_if_exists(&temp)?;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(CREDENTIAL_FILE_MODE)
        .open(&temp)
        .map_err(io_error)?;
    file.write_all(credential.expose().as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(io_error)?;
    fs::rename(&temp, path).map_err(io_error)
}

fn remove_if_exists(path: &Path) -> Result<(), ConfigError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Proxy daemon command line.
pub fn proxy_command(program: &Path, config_path: &Path) -> ServiceCommand {
    ServiceCommand::new(program)
        .args(["run", "-c"])
        .arg(config_path.as_os_str())
}

/// Tunnel client command line for `binding`, forwarding to the proxy's `listen_port`.
pub fn tunnel_command(program: &Path, binding: &TunnelBinding, listen_port: u16) -> ServiceCommand {
    let command = ServiceCommand::new(program).args([
        "tunnel",
        "--edge-ip-version",
        "auto",
        "--no-autoupdate",
        "--protocol",
        "http2",
    ]);

    match binding.credential() {
        Some(credential) if binding.mode() == TunnelMode::Fixed => command
            .args(["run", "--token"])
            .secret_arg(credential.expose()),
        _ => command
            .arg("--url")
            .arg(format!("http://localhost:{listen_port}")),
    }
}
