//! Liveness probing for recorded services.
//!
//! A recorded PID is only trusted after the operating system confirms a live
//! process still owns it. There is no generation guard: if a service crashes and
//! the kernel hands its PID to an unrelated process, the probe reports the service
//! as running. This is a known weakness of PID-file supervision and is accepted here.
use std::fmt;

#[cfg(target_os = "linux")]
use std::{fs, path::Path};

use nix::{errno::Errno, sys::signal, unistd::Pid};
use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};

use crate::{constants::ServiceName, error::RecordStoreError, records::ProcessRecordStore};

/// Derived state of a managed service. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Record exists and a live process owns the PID.
    Running,
    /// Record exists but nothing owns the PID any more.
    Dead,
    /// No record.
    Stopped,
}

impl ServiceState {
    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Running)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceState::Running => "running",
            ServiceState::Dead => "dead",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Result of probing a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    /// Reconciled state.
    pub state: ServiceState,
    /// Recorded PID, if any.
    pub pid: Option<u32>,
}

/// Reconciles PID records against the process table.
pub struct ServiceProbe<'a> {
    records: &'a dyn ProcessRecordStore,
}

impl<'a> ServiceProbe<'a> {
    /// Creates a probe reading from `records`.
    pub fn new(records: &'a dyn ProcessRecordStore) -> Self {
        Self { records }
    }

    /// Returns whether the recorded PID for `name` belongs to a live process.
    pub fn is_live(&self, name: ServiceName) -> Result<bool, RecordStoreError> {
        Ok(self.probe(name)?.state == ServiceState::Running)
    }

    /// Reconciled state of `name`.
    pub fn state(&self, name: ServiceName) -> Result<ServiceState, RecordStoreError> {
        Ok(self.probe(name)?.state)
    }

    /// Probes `name` and returns its state along with the recorded PID.
    pub fn probe(&self, name: ServiceName) -> Result<ProbeResult, RecordStoreError> {
        let pid = self.records.get(name)?;
        let state = match pid {
            None => ServiceState::Stopped,
            Some(pid) if pid_is_alive(pid) => ServiceState::Running,
            Some(_) => ServiceState::Dead,
        };
        Ok(ProbeResult { state, pid })
    }
}

/// Returns whether a live, non-zombie process owns `pid`.
pub fn pid_is_alive(pid: u32) -> bool {
    // PID 0 and values beyond i32 would address process groups or wrap.
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    matches!(read_proc_state(pid), Some('Z' | 'X'))
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn read_proc_state(pid: u32) -> Option<char> {
    let stat_path = format!("/proc/{pid}/stat");
    let contents = fs::read_to_string(Path::new(&stat_path)).ok()?;
    // The command name is wrapped in parentheses and may contain spaces.
    let after_comm = &contents[contents.rfind(')')? + 1..];
    after_comm.trim_start().chars().next()
}

/// Resource details for a running process, shown by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessDetails {
    /// Seconds since the process started.
    pub uptime_secs: u64,
    /// Resident memory in bytes.
    pub rss_bytes: u64,
}

impl ProcessDetails {
    /// Looks up `pid` in the process table.
    pub fn inspect(pid: u32) -> Option<Self> {
        let target = sysinfo::Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        system.process(target).map(|process| Self {
            uptime_secs: process.run_time(),
            rss_bytes: process.memory(),
        })
    }
}

/// Formats elapsed seconds as a short human-readable duration.
pub fn format_elapsed(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
