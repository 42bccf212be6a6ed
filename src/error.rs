//! Error handling for edgevisor.
use std::path::PathBuf;

use thiserror::Error;

use crate::constants::ServiceName;

/// Top-level error surfaced by supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A service failed to come up.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// A service could not be stopped cleanly.
    #[error(transparent)]
    Termination(#[from] TerminationError),

    /// Install settings are missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The process record store could not be read or written.
    #[error(transparent)]
    Records(#[from] RecordStoreError),

    /// A required external executable is unavailable.
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// Generic filesystem failure while managing persisted state.
    #[error("Filesystem error at {path}: {source}")]
    Io {
        /// Path that was being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A service failed to launch; services already running were left as they were.
    #[error("Launch left the system partially running: {}", describe_failures(.failures))]
    PartiallyRunning {
        /// Launch failures, in launch order.
        failures: Vec<LaunchError>,
    },
}

fn describe_failures(failures: &[LaunchError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl SupervisorError {
    /// Services whose launch failed, when this is a launch failure.
    pub fn failed_services(&self) -> Vec<ServiceName> {
        match self {
            SupervisorError::Launch(err) => vec![err.service()],
            SupervisorError::PartiallyRunning { failures } => {
                failures.iter().map(LaunchError::service).collect()
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SupervisorError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while launching a managed service.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The process exited before the grace period elapsed.
    #[error(
        "Service '{service}' (PID {pid}) exited during the startup grace period; see {log}"
    )]
    ExitedDuringGrace {
        /// Service that died.
        service: ServiceName,
        /// PID that was recorded for it.
        pid: u32,
        /// Log artifact holding its output.
        log: PathBuf,
    },

    /// The command could not be spawned at all.
    #[error("Failed to start service '{service}': {source}")]
    Spawn {
        /// Service that failed to spawn.
        service: ServiceName,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The log artifact could not be opened for redirection.
    #[error("Failed to open log {log} for '{service}': {source}")]
    LogSink {
        /// Service whose log could not be opened.
        service: ServiceName,
        /// Log path.
        log: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The PID could not be persisted.
    #[error("Failed to record PID for '{service}': {source}")]
    Record {
        /// Service being launched.
        service: ServiceName,
        /// The underlying store error.
        #[source]
        source: RecordStoreError,
    },
}

impl LaunchError {
    /// Service the failure belongs to.
    pub fn service(&self) -> ServiceName {
        match self {
            LaunchError::ExitedDuringGrace { service, .. }
            | LaunchError::Spawn { service, .. }
            | LaunchError::LogSink { service, .. }
            | LaunchError::Record { service, .. } => *service,
        }
    }

    /// Log artifact associated with this failure, when known.
    pub fn log_path(&self) -> Option<&PathBuf> {
        match self {
            LaunchError::ExitedDuringGrace { log, .. } | LaunchError::LogSink { log, .. } => {
                Some(log)
            }
            _ => None,
        }
    }
}

/// Errors raised while stopping a managed service.
#[derive(Debug, Error)]
pub enum TerminationError {
    /// The process was still alive after SIGKILL. The record has been cleared anyway.
    #[error(
        "Service '{service}' (PID {pid}) did not exit after SIGKILL; its record was cleared"
    )]
    EscalationFailed {
        /// Service that survived.
        service: ServiceName,
        /// The surviving PID.
        pid: u32,
    },

    /// Signal delivery failed for a reason other than the process being gone.
    #[error("Failed to signal service '{service}' (PID {pid}): {source}")]
    Signal {
        /// Service being stopped.
        service: ServiceName,
        /// Target PID.
        pid: u32,
        /// The underlying error.
        #[source]
        source: nix::errno::Errno,
    },

    /// The record could not be cleared.
    #[error("Failed to clear PID record for '{service}': {source}")]
    Record {
        /// Service being stopped.
        service: ServiceName,
        /// The underlying store error.
        #[source]
        source: RecordStoreError,
    },
}

/// Errors related to install settings and generated configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An operation that needs a prior install found none.
    #[error("edgevisor is not installed; run `edgevisor install` first")]
    MissingInstall,

    /// Failed to read or write a settings artifact.
    #[error("Failed to access {path}: {source}")]
    Io {
        /// Artifact path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A JSON artifact could not be parsed or produced.
    #[error("Invalid JSON in {path}: {source}")]
    Json {
        /// Artifact path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A YAML install plan could not be parsed.
    #[error("Invalid install plan {path}: {source}")]
    Plan {
        /// Plan path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_yaml::Error,
    },

    /// Validation failed before any side effect was attempted.
    #[error("Invalid install settings: {0}")]
    Invalid(String),
}

/// Errors raised by the process record store.
#[derive(Debug, Error)]
pub enum RecordStoreError {
    /// Failed to read, write or lock the record file.
    #[error("Failed to access PID records: {0}")]
    Io(#[from] std::io::Error),

    /// The record file is not valid JSON.
    #[error("Failed to parse PID records: {0}")]
    Parse(#[from] serde_json::Error),

    /// Mutex for an in-memory store was poisoned.
    #[error("PID record lock is poisoned: {0}")]
    Poisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for RecordStoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        RecordStoreError::Poisoned(err.to_string())
    }
}

/// Errors raised while resolving external executables.
#[derive(Debug, Error)]
pub enum DependencyError {
    /// The executable could not be found anywhere on the search path.
    #[error(
        "Required executable '{tool}' not found (searched {searched:?}); install it manually"
    )]
    DependencyMissing {
        /// Executable name.
        tool: String,
        /// Locations that were checked.
        searched: Vec<PathBuf>,
    },

    /// A package manager was found but installing the tool failed.
    #[error("Installing '{tool}' with {manager} failed ({detail}); install it manually")]
    RemediationFailed {
        /// Executable name.
        tool: String,
        /// Package manager that was tried.
        manager: String,
        /// Exit status or spawn error.
        detail: String,
    },
}
