//! Stopping managed services.
use std::time::Duration;

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, error, info, warn};

use crate::{
    clock::Sleeper,
    constants::ServiceName,
    error::{RecordStoreError, TerminationError},
    probe::{ServiceProbe, ServiceState, pid_is_alive},
    records::ProcessRecordStore,
};

/// What [`ServiceTerminator::stop`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No record existed.
    AlreadyStopped,
    /// The record pointed at a dead process and was cleared.
    ClearedStale {
        /// The stale PID.
        pid: u32,
    },
    /// The process exited after SIGTERM.
    Terminated {
        /// The stopped PID.
        pid: u32,
    },
    /// The process needed SIGKILL.
    Killed {
        /// The killed PID.
        pid: u32,
    },
}

/// Stops services with SIGTERM, escalating to SIGKILL.
///
/// The record is cleared in every case, even when the process survives SIGKILL.
/// That situation is reported as [`TerminationError::EscalationFailed`] after the
/// record is gone; the operator is expected to investigate or reboot.
pub struct ServiceTerminator<'a> {
    records: &'a dyn ProcessRecordStore,
    sleeper: &'a dyn Sleeper,
    checks: usize,
    interval: Duration,
}

impl<'a> ServiceTerminator<'a> {
    /// Creates a terminator waiting `checks × interval` after each signal.
    pub fn new(
        records: &'a dyn ProcessRecordStore,
        sleeper: &'a dyn Sleeper,
        checks: usize,
        interval: Duration,
    ) -> Self {
        Self {
            records,
            sleeper,
            checks,
            interval,
        }
    }

    /// Stops `name`. A service without a record is left alone.
    pub fn stop(&self, name: ServiceName) -> Result<StopOutcome, TerminationError> {
        let record_error = |source: RecordStoreError| TerminationError::Record {
            service: name,
            source,
        };
        let probe = ServiceProbe::new(self.records)
            .probe(name)
            .map_err(record_error)?;

        let pid = match (probe.state, probe.pid) {
            (ServiceState::Stopped, _) | (_, None) => {
                debug!("Service '{name}' has no PID record; nothing to stop");
                return Ok(StopOutcome::AlreadyStopped);
            }
            (ServiceState::Dead, Some(pid)) => {
                info!("Service '{name}' (PID {pid}) was not running; clearing stale record");
                self.records.clear(name).map_err(record_error)?;
                return Ok(StopOutcome::ClearedStale { pid });
            }
            (ServiceState::Running, Some(pid)) => pid,
        };

        info!("Stopping service '{name}' (PID {pid})");
        let result = self.escalate(name, pid);

        self.records.clear(name).map_err(record_error)?;

        match &result {
            Ok(_) => debug!("Service '{name}' stopped successfully."),
            Err(err) => warn!("{err}"),
        }
        result
    }

    fn escalate(&self, name: ServiceName, pid: u32) -> Result<StopOutcome, TerminationError> {
        if !self.signal(name, pid, Signal::SIGTERM)? || self.wait_for_exit(pid) {
            return Ok(StopOutcome::Terminated { pid });
        }

        warn!("Service '{name}' did not exit after SIGTERM; sending SIGKILL");
        if !self.signal(name, pid, Signal::SIGKILL)? || self.wait_for_exit(pid) {
            return Ok(StopOutcome::Killed { pid });
        }

        error!("Service '{name}' (PID {pid}) survived SIGKILL");
        Err(TerminationError::EscalationFailed { service: name, pid })
    }

    /// Signals the service's process group and the process itself.
    ///
    /// Returns `false` when the process was already gone.
    fn signal(
        &self,
        name: ServiceName,
        pid: u32,
        sig: Signal,
    ) -> Result<bool, TerminationError> {
        let target = Pid::from_raw(pid as i32);

        let supervisor_pgid = unsafe { libc::getpgid(0) };
        let child_pgid = unsafe { libc::getpgid(target.as_raw()) };
        if child_pgid >= 0 && child_pgid != supervisor_pgid {
            match signal::killpg(Pid::from_raw(child_pgid), sig) {
                Ok(()) => debug!("Sent {sig} to process group {child_pgid} for '{name}'"),
                Err(Errno::ESRCH) => {
                    debug!("Process group for '{name}' missing; falling back to direct signal")
                }
                Err(Errno::EPERM) => warn!(
                    "Insufficient permissions to signal process group {child_pgid} for '{name}'. Falling back to direct signal"
                ),
                Err(source) => {
                    return Err(TerminationError::Signal {
                        service: name,
                        pid,
                        source,
                    });
                }
            }
        }

        match signal::kill(target, sig) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => {
                debug!("Service '{name}' exited before {sig} could be delivered");
                Ok(false)
            }
            Err(source) => Err(TerminationError::Signal {
                service: name,
                pid,
                source,
            }),
        }
    }

    fn wait_for_exit(&self, pid: u32) -> bool {
        for _ in 0..self.checks {
            self.sleeper.sleep(self.interval);
            if !pid_is_alive(pid) {
                return true;
            }
        }
        !pid_is_alive(pid)
    }
}
