//! Starting managed services.
use std::{
    ffi::OsString,
    fmt,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    clock::Sleeper,
    constants::ServiceName,
    error::LaunchError,
    logs::LogSink,
    probe::ServiceProbe,
    records::ProcessRecordStore,
};

/// Command line for a managed service.
///
/// Arguments marked secret are masked whenever the command is displayed.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceCommand {
    program: PathBuf,
    args: Vec<OsString>,
    secret_args: Vec<usize>,
}

impl ServiceCommand {
    /// Starts a command line for `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            secret_args: Vec::new(),
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends an argument that must never be logged.
    pub fn secret_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.secret_args.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    /// Executable path.
    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Raw arguments, secrets included.
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }
}

impl fmt::Display for ServiceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for (index, arg) in self.args.iter().enumerate() {
            if self.secret_args.contains(&index) {
                write!(f, " ***")?;
            } else {
                write!(f, " {}", arg.to_string_lossy())?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceCommand({self})")
    }
}

/// Outcome of a successful [`ServiceLauncher::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOutcome {
    /// PID owning the service.
    pub pid: u32,
    /// True when the service was already running and nothing was spawned.
    pub reused: bool,
}

/// Spawns services, confirms they survive startup, and records their PIDs.
///
/// The launcher never retries. A service that exits during the grace period is
/// reported and its record is left in place, so the next probe reports it as dead.
pub struct ServiceLauncher<'a> {
    records: &'a dyn ProcessRecordStore,
    sleeper: &'a dyn Sleeper,
    grace: Duration,
}

impl<'a> ServiceLauncher<'a> {
    /// Creates a launcher.
    pub fn new(
        records: &'a dyn ProcessRecordStore,
        sleeper: &'a dyn Sleeper,
        grace: Duration,
    ) -> Self {
        Self {
            records,
            sleeper,
            grace,
        }
    }

    /// Starts `name` with `command`, redirecting its output into `sink`.
    pub fn start(
        &self,
        name: ServiceName,
        command: &ServiceCommand,
        sink: &LogSink,
    ) -> Result<LaunchOutcome, LaunchError> {
        let probe = ServiceProbe::new(self.records);
        let current = probe.probe(name).map_err(|source| LaunchError::Record {
            service: name,
            source,
        })?;

        if let Some(pid) = current.pid.filter(|_| current.state.is_running()) {
            info!("Service '{name}' already running (PID {pid})");
            return Ok(LaunchOutcome { pid, reused: true });
        }

        info!("Starting service '{name}': {command}");
        let (stdout, stderr) = sink.open().map_err(|source| LaunchError::LogSink {
            service: name,
            log: sink.path().to_path_buf(),
            source,
        })?;

        let mut child = Command::new(command.program())
            .args(command.arguments())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                service: name,
                source,
            })?;
        let pid = child.id();

        if let Err(source) = self.records.put(name, pid) {
            warn!("Failed to record PID {pid} for '{name}'; killing the untracked process");
            let _ = child.kill();
            let _ = child.wait();
            return Err(LaunchError::Record {
                service: name,
                source,
            });
        }

        // Reap the child if it exits while this invocation is still alive; once
        // we exit it is reparented and outlives us.
        thread::spawn(move || {
            let _ = child.wait();
        });

        debug!("Waiting {:?} for '{name}' (PID {pid}) to settle", self.grace);
        self.sleeper.sleep(self.grace);

        let confirmed = probe.is_live(name).map_err(|source| LaunchError::Record {
            service: name,
            source,
        })?;
        if !confirmed {
            warn!(
                "Service '{name}' (PID {pid}) exited during startup; see {}",
                sink.path().display()
            );
            return Err(LaunchError::ExitedDuringGrace {
                service: name,
                pid,
                log: sink.path().to_path_buf(),
            });
        }

        info!("Service '{name}' running with PID {pid}");
        Ok(LaunchOutcome { pid, reused: false })
    }
}
