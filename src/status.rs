//! Status reports for the managed pair.
use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    constants::ServiceName,
    probe::{ProcessDetails, ServiceState, format_elapsed},
    tunnel::TunnelMode,
};

const GREEN_BOLD: &str = "\x1b[1;32m";
const RED_BOLD: &str = "\x1b[1;31m";
const MAGENTA_BOLD: &str = "\x1b[1;35m";
const YELLOW_BOLD: &str = "\x1b[1;33m";
const RESET: &str = "\x1b[0m";

/// Overall state of the supervisor, derived from install settings and probes.
///
/// `Installing` and `Uninstalling` only exist while those operations run; they
/// show up in logs, never in a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    NotInstalled,
    Installing,
    Running,
    PartiallyRunning,
    Stopped,
    Uninstalling,
}

impl SupervisorState {
    /// Derives the steady state from per-service states.
    ///
    /// `Stopped` requires every record to be absent; a dead service always
    /// surfaces as `PartiallyRunning`.
    pub fn derive(installed: bool, services: &[ServiceState]) -> Self {
        if !installed {
            return SupervisorState::NotInstalled;
        }
        if services.iter().all(|state| *state == ServiceState::Stopped) {
            SupervisorState::Stopped
        } else if services.iter().all(ServiceState::is_running) {
            SupervisorState::Running
        } else {
            SupervisorState::PartiallyRunning
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SupervisorState::NotInstalled => "not installed",
            SupervisorState::Installing => "installing",
            SupervisorState::Running => "running",
            SupervisorState::PartiallyRunning => "partially running",
            SupervisorState::Stopped => "stopped",
            SupervisorState::Uninstalling => "uninstalling",
        };
        f.write_str(label)
    }
}

/// Where the reported public hostname came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointSource {
    /// Supplied by the operator for a fixed tunnel.
    Configured,
    /// Read from the current run of the tunnel log.
    Discovered,
    /// Remembered from an earlier discovery; the tunnel is not running now.
    Cached,
    /// Not known yet.
    Pending,
}

/// Public endpoint of the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub hostname: Option<String>,
    pub source: EndpointSource,
}

impl Endpoint {
    /// Endpoint whose hostname is not known yet.
    pub fn pending() -> Self {
        Self {
            hostname: None,
            source: EndpointSource::Pending,
        }
    }
}

/// Status of one managed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub name: ServiceName,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub log_path: PathBuf,
    pub uptime_secs: Option<u64>,
    pub rss_bytes: Option<u64>,
}

impl ServiceStatus {
    /// Builds a status line, attaching process details when the service is running.
    pub fn new(name: ServiceName, state: ServiceState, pid: Option<u32>, log_path: PathBuf) -> Self {
        let details = pid
            .filter(|_| state.is_running())
            .and_then(ProcessDetails::inspect);
        Self {
            name,
            state,
            pid,
            log_path,
            uptime_secs: details.map(|details| details.uptime_secs),
            rss_bytes: details.map(|details| details.rss_bytes),
        }
    }
}

/// Everything `status` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub state: SupervisorState,
    pub identity: String,
    pub listen_port: u16,
    pub transport_path: String,
    pub tunnel_mode: TunnelMode,
    pub installed_at: DateTime<Utc>,
    pub endpoint: Endpoint,
    pub services: Vec<ServiceStatus>,
}

impl StatusReport {
    /// Status entry for `name`.
    pub fn service(&self, name: ServiceName) -> Option<&ServiceStatus> {
        self.services.iter().find(|status| status.name == name)
    }

    /// Pretty JSON rendering for `status --json`.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.state {
            SupervisorState::Running => GREEN_BOLD,
            SupervisorState::PartiallyRunning => YELLOW_BOLD,
            _ => RED_BOLD,
        };
        writeln!(f, "{color}● edgevisor {}{RESET}", self.state)?;
        writeln!(f, "   Identity: {}", self.identity)?;
        writeln!(
            f,
            "     Listen: 127.0.0.1:{} (path {})",
            self.listen_port, self.transport_path
        )?;
        writeln!(
            f,
            "  Installed: {}",
            self.installed_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;

        let endpoint = match (&self.endpoint.hostname, self.endpoint.source) {
            (Some(hostname), EndpointSource::Cached) => {
                format!("{hostname} (last known, tunnel not running)")
            }
            (Some(hostname), _) => hostname.clone(),
            (None, _) => format!("{YELLOW_BOLD}pending{RESET}"),
        };
        writeln!(f, "     Tunnel: {} {}", self.tunnel_mode, endpoint)?;

        for service in &self.services {
            writeln!(f)?;
            match (service.state, service.pid) {
                (ServiceState::Running, Some(pid)) => {
                    writeln!(f, "{GREEN_BOLD}● {} Running{RESET}", service.name)?;
                    writeln!(f, " Main PID: {pid}")?;
                    if let Some(uptime) = service.uptime_secs {
                        writeln!(f, "   Active: {}", format_elapsed(uptime))?;
                    }
                    if let Some(rss) = service.rss_bytes {
                        writeln!(
                            f,
                            "   {MAGENTA_BOLD}Memory: {:.1}M{RESET}",
                            rss as f64 / (1024.0 * 1024.0)
                        )?;
                    }
                }
                (ServiceState::Dead, Some(pid)) => {
                    writeln!(
                        f,
                        "{RED_BOLD}● {} Dead{RESET} (process {pid} not found)",
                        service.name
                    )?;
                }
                _ => writeln!(f, "● {} - Not running", service.name)?,
            }
            writeln!(f, "      Log: {}", service.log_path.display())?;
        }
        Ok(())
    }
}
