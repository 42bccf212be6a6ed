//! Constants and configuration values for edgevisor.
//!
//! This module centralizes file names, timing knobs and the fixed set of managed
//! services so the rest of the crate never hard-codes them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

// ============================================================================
// Managed services
// ============================================================================

/// The fixed set of services edgevisor supervises.
///
/// Declaration order is launch order. Stop order is the reverse, so the tunnel
/// stops advertising before the backend it forwards to disappears.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServiceName {
    /// The proxy-protocol daemon.
    Proxy,
    /// The tunnel client forwarding public traffic to the proxy.
    Tunnel,
}

impl ServiceName {
    /// Services in launch order.
    pub const LAUNCH_ORDER: [ServiceName; 2] = [ServiceName::Proxy, ServiceName::Tunnel];

    /// Services in stop order.
    pub const STOP_ORDER: [ServiceName; 2] = [ServiceName::Tunnel, ServiceName::Proxy];

    /// Default executable name searched for this service.
    pub const fn default_program(&self) -> &'static str {
        match self {
            ServiceName::Proxy => PROXY_PROGRAM,
            ServiceName::Tunnel => TUNNEL_PROGRAM,
        }
    }
}

/// Default proxy daemon executable.
pub const PROXY_PROGRAM: &str = "xray";

/// Default tunnel client executable.
pub const TUNNEL_PROGRAM: &str = "cloudflared";

// ============================================================================
// File System Constants
// ============================================================================

/// Environment variable overriding the state root.
pub const HOME_ENV: &str = "EDGEVISOR_HOME";

/// State root relative to `$HOME` when `EDGEVISOR_HOME` is unset.
pub const DEFAULT_HOME_SUFFIX: &str = ".local/share/edgevisor";

/// Name of the PID record file stored in the run directory.
pub const PID_FILE_NAME: &str = "pid.json";

/// Lock file suffix for the PID file to ensure exclusive access.
pub const PID_LOCK_SUFFIX: &str = ".lock";

/// Generated proxy daemon configuration.
pub const PROXY_CONFIG_FILE_NAME: &str = "config.json";

/// Persisted install settings.
pub const INSTALL_FILE_NAME: &str = "install.json";

/// Persisted fixed-tunnel binding (hostname only; the token lives apart).
pub const TUNNEL_BINDING_FILE_NAME: &str = "tunnel.json";

/// Fixed-tunnel credential.
pub const TUNNEL_TOKEN_FILE_NAME: &str = "tunnel.token";

/// Last discovered ephemeral hostname.
pub const HOSTNAME_CACHE_FILE_NAME: &str = "hostname";

/// Prefix of the marker line written to a service log before each launch.
pub const LAUNCH_MARKER_PREFIX: &str = "--- edgevisor: starting";

/// Permissions applied to the credential file.
pub const CREDENTIAL_FILE_MODE: u32 = 0o600;

// ============================================================================
// Proxy daemon configuration
// ============================================================================

/// Default loopback port the proxy daemon listens on.
pub const DEFAULT_LISTEN_PORT: u16 = 30028;

/// Address the proxy daemon binds to; only the tunnel reaches it.
pub const LISTEN_ADDRESS: &str = "127.0.0.1";

/// Maximum early data accepted on the websocket transport.
pub const MAX_EARLY_DATA: u32 = 2048;

/// Header carrying early data on the websocket transport.
pub const EARLY_DATA_HEADER: &str = "Sec-WebSocket-Protocol";

// ============================================================================
// Endpoint discovery
// ============================================================================

/// Domain suffix of hostnames assigned to ephemeral tunnels.
pub const EPHEMERAL_DOMAIN_SUFFIX: &str = "trycloudflare.com";

/// Pattern matching a well-formed ephemeral tunnel URL in the tunnel log.
pub const EPHEMERAL_HOSTNAME_PATTERN: &str =
    r"https://([a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.trycloudflare\.com)\b";

/// Control-plane host that shows up in tunnel error lines; never a tunnel endpoint.
pub const EPHEMERAL_API_HOST: &str = "api.trycloudflare.com";

// ============================================================================
// Process Management Timing
// ============================================================================

/// Wait after spawning before confirming the process survived startup.
pub const LAUNCH_GRACE_PERIOD: Duration = Duration::from_millis(1500);

/// Number of liveness checks after each termination signal.
pub const STOP_CHECKS: usize = 10;

/// Interval between liveness checks after a termination signal.
pub const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Interval between endpoint discovery polls.
pub const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Number of endpoint discovery polls before giving up.
pub const DISCOVERY_ATTEMPTS: usize = 15;

/// Default number of lines shown by `logs`.
pub const DEFAULT_LOG_LINES: usize = 50;

/// Timing knobs for lifecycle operations.
///
/// Production code uses [`Timings::default`]; tests shrink the waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Wait between spawn and the liveness confirmation.
    pub launch_grace: Duration,
    /// Liveness checks after SIGTERM and again after SIGKILL.
    pub stop_checks: usize,
    /// Interval between those checks.
    pub stop_check_interval: Duration,
    /// Interval between discovery polls.
    pub discovery_interval: Duration,
    /// Discovery polls before the hostname is reported as pending.
    pub discovery_attempts: usize,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            launch_grace: LAUNCH_GRACE_PERIOD,
            stop_checks: STOP_CHECKS,
            stop_check_interval: STOP_CHECK_INTERVAL,
            discovery_interval: DISCOVERY_POLL_INTERVAL,
            discovery_attempts: DISCOVERY_ATTEMPTS,
        }
    }
}
