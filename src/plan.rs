//! Install plans: everything `install` needs, validated before any side effect.
use std::{fs, path::Path};

use serde::Deserialize;

use crate::{
    config::{ServiceConfig, generate_identity},
    constants::DEFAULT_LISTEN_PORT,
    error::ConfigError,
    tunnel::{Credential, TunnelBinding, TunnelMode},
};

/// Unvalidated install input, from CLI flags, prompts or a YAML plan file.
///
/// ```yaml
/// identity: 0f8e...        # optional, generated when absent
/// listen_port: 30028       # optional
/// tunnel:
///   mode: fixed            # or ephemeral
///   token: eyJh...
///   hostname: edge.example.com
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallPlan {
    pub identity: Option<String>,
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub tunnel: TunnelPlan,
}

/// Tunnel part of an [`InstallPlan`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelPlan {
    pub mode: Option<TunnelMode>,
    pub token: Option<String>,
    pub hostname: Option<String>,
}

/// Validated install input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPlan {
    pub service: ServiceConfig,
    pub tunnel: TunnelBinding,
}

impl InstallPlan {
    /// Loads a plan from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Plan {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fills unset fields from `other`, keeping values already set here.
    pub fn or(self, other: InstallPlan) -> Self {
        Self {
            identity: self.identity.or(other.identity),
            listen_port: self.listen_port.or(other.listen_port),
            tunnel: TunnelPlan {
                mode: self.tunnel.mode.or(other.tunnel.mode),
                token: self.tunnel.token.or(other.tunnel.token),
                hostname: self.tunnel.hostname.or(other.tunnel.hostname),
            },
        }
    }

    /// Validates the plan, generating an identity when none was supplied.
    ///
    /// The tunnel mode defaults to fixed when a token is present, ephemeral otherwise.
    pub fn validate(self) -> Result<ValidatedPlan, ConfigError> {
        let identity = match self.identity.filter(|id| !id.trim().is_empty()) {
            Some(identity) => identity.trim().to_string(),
            None => generate_identity(),
        };
        let service =
            ServiceConfig::new(identity, self.listen_port.unwrap_or(DEFAULT_LISTEN_PORT))?;

        let TunnelPlan {
            mode,
            token,
            hostname,
        } = self.tunnel;
        let token = token.filter(|token| !token.trim().is_empty());
        let hostname = hostname.filter(|hostname| !hostname.trim().is_empty());
        let mode = mode.unwrap_or(if token.is_some() {
            TunnelMode::Fixed
        } else {
            TunnelMode::Ephemeral
        });

        let tunnel = match mode {
            TunnelMode::Ephemeral => {
                if token.is_some() {
                    return Err(ConfigError::Invalid(
                        "a tunnel token requires the fixed tunnel mode".into(),
                    ));
                }
                if hostname.is_some() {
                    return Err(ConfigError::Invalid(
                        "a tunnel hostname requires a token and the fixed tunnel mode".into(),
                    ));
                }
                TunnelBinding::ephemeral()
            }
            TunnelMode::Fixed => {
                let token = token.ok_or_else(|| {
                    ConfigError::Invalid("fixed tunnel mode requires a token".into())
                })?;
                let hostname = hostname.ok_or_else(|| {
                    ConfigError::Invalid("fixed tunnel mode requires a hostname".into())
                })?;
                TunnelBinding::fixed(Credential::new(token)?, hostname)?
            }
        };

        Ok(ValidatedPlan { service, tunnel })
    }
}
