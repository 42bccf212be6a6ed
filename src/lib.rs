//! Edgevisor supervises a local proxy-protocol daemon and the tunnel client that
//! publishes it. It generates the proxy configuration, starts both processes in
//! order, tracks them through persisted PID records, discovers the tunnel's public
//! hostname from its log, and stops them with signal escalation.

/// CLI interface.
pub mod cli;

/// Blocking waits and cancellation.
pub mod clock;

/// Proxy configuration and install settings.
pub mod config;

/// Names, paths and timing defaults.
pub mod constants;

/// External executable resolution.
pub mod deps;

/// Tunnel hostname discovery.
pub mod discovery;

/// Error handling.
pub mod error;

/// Starting services.
pub mod launcher;

/// Log capture and reading.
pub mod logs;

/// Install plans.
pub mod plan;

/// Liveness probing.
pub mod probe;

/// PID records.
pub mod records;

/// Runtime directory layout.
pub mod runtime;

/// Status reports.
pub mod status;

/// Lifecycle operations.
pub mod supervisor;

/// Stopping services.
pub mod terminator;

/// Tunnel binding and service command lines.
pub mod tunnel;

/// Shared helpers for tests that touch process-wide state.
#[doc(hidden)]
pub mod test_utils;
