//! Lifecycle operations over the managed proxy and tunnel pair.
//!
//! Every operation is a short-lived call made from one CLI invocation; nothing
//! here runs in the background. Persisted artifacts under the runtime root are
//! the only state shared between invocations.
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    time::Instant,
};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::{
    clock::{CancelToken, Sleeper, ThreadSleeper},
    config::{InstallSettings, ServiceConfig},
    constants::{ServiceName, Timings},
    deps::ToolResolver,
    discovery::{
        DiscoveryBudget, EndpointDiscoverer, read_cached_hostname, scan_latest_run,
        write_cached_hostname,
    },
    error::{ConfigError, DependencyError, SupervisorError, TerminationError},
    launcher::{LaunchOutcome, ServiceLauncher},
    logs::{LogSink, LogTail, launch_marker},
    plan::ValidatedPlan,
    probe::ServiceProbe,
    records::{PidFileStore, ProcessRecordStore, ServiceRecord},
    runtime::RuntimeLayout,
    status::{Endpoint, EndpointSource, ServiceStatus, StatusReport, SupervisorState},
    terminator::{ServiceTerminator, StopOutcome},
    tunnel::{TunnelBinding, TunnelMode, proxy_command, tunnel_command},
};

/// Resolved executables for both services.
#[derive(Debug, Clone)]
struct Programs {
    proxy: PathBuf,
    tunnel: PathBuf,
}

/// Result of a successful `install` or `restart`.
#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub service: ServiceConfig,
    pub tunnel: TunnelBinding,
    pub proxy_pid: u32,
    pub tunnel_pid: u32,
}

impl LaunchReport {
    /// Public hostname; `None` while an ephemeral hostname is still pending.
    pub fn hostname(&self) -> Option<&str> {
        self.tunnel.hostname()
    }
}

impl fmt::Display for LaunchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Proxy running (PID {})", self.proxy_pid)?;
        writeln!(f, "Tunnel running (PID {})", self.tunnel_pid)?;
        writeln!(f, "Identity: {}", self.service.identity())?;
        writeln!(f, "Path: {}", self.service.transport_path())?;
        match self.hostname() {
            Some(hostname) => writeln!(f, "Hostname: {hostname}"),
            None => writeln!(
                f,
                "Hostname: pending; run `edgevisor status` once the tunnel has registered"
            ),
        }
    }
}

/// One service handled by `stop`.
#[derive(Debug)]
pub struct StopEntry {
    pub service: ServiceName,
    pub result: Result<StopOutcome, TerminationError>,
    pub finished_at: Instant,
}

/// Per-service results of `stop`, in the order the services were stopped.
#[derive(Debug, Default)]
pub struct StopReport {
    pub entries: Vec<StopEntry>,
}

impl StopReport {
    /// Services in the order they were stopped.
    pub fn order(&self) -> Vec<ServiceName> {
        self.entries.iter().map(|entry| entry.service).collect()
    }

    /// Services whose process survived SIGKILL.
    pub fn survivors(&self) -> Vec<(ServiceName, u32)> {
        self.entries
            .iter()
            .filter_map(|entry| match &entry.result {
                Err(TerminationError::EscalationFailed { service, pid }) => Some((*service, *pid)),
                _ => None,
            })
            .collect()
    }

    fn into_hard_error(self) -> Result<Self, SupervisorError> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            match entry.result {
                Err(err) if !matches!(err, TerminationError::EscalationFailed { .. }) => {
                    return Err(err.into());
                }
                result => entries.push(StopEntry { result, ..entry }),
            }
        }
        Ok(Self { entries })
    }
}

/// Supervises the proxy and tunnel daemons for one runtime root.
pub struct Supervisor {
    layout: RuntimeLayout,
    records: PidFileStore,
    tools: ToolResolver,
    install_missing_tools: bool,
    timings: Timings,
    sleeper: Box<dyn Sleeper>,
    cancel: CancelToken,
}

impl Supervisor {
    /// Creates a supervisor for `layout` with production timings.
    pub fn new(layout: RuntimeLayout) -> Self {
        let records = PidFileStore::new(layout.pid_file());
        let tools = ToolResolver::new(layout.bin_dir());
        Self {
            layout,
            records,
            tools,
            install_missing_tools: false,
            timings: Timings::default(),
            sleeper: Box::new(ThreadSleeper),
            cancel: CancelToken::new(),
        }
    }

    /// Overrides lifecycle timings.
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Overrides how waits are performed.
    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Token that interrupts hostname discovery when cancelled.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Overrides executable resolution.
    pub fn with_tools(mut self, tools: ToolResolver) -> Self {
        self.tools = tools;
        self
    }

    /// Lets `install` try a system package manager for missing executables.
    pub fn with_tool_installation(mut self, enabled: bool) -> Self {
        self.install_missing_tools = enabled;
        self
    }

    /// Runtime root this supervisor manages.
    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    /// PID record store.
    pub fn records(&self) -> &dyn ProcessRecordStore {
        &self.records
    }

    /// Log artifact of `service`.
    pub fn log_path(&self, service: ServiceName) -> PathBuf {
        self.layout.log_path(service)
    }

    /// Persisted record snapshot for every service, in launch order.
    pub fn service_records(&self) -> Result<Vec<ServiceRecord>, SupervisorError> {
        ServiceName::LAUNCH_ORDER
            .into_iter()
            .map(|name| -> Result<ServiceRecord, SupervisorError> {
                Ok(ServiceRecord {
                    name,
                    pid: self.records.get(name)?,
                    log_path: self.log_path(name),
                })
            })
            .collect()
    }

    /// Installs and launches both services from a validated plan.
    ///
    /// Executables are resolved before anything is written. A previous install is
    /// stopped first so the new identity takes effect, and its settings are
    /// overwritten.
    pub fn install(&self, plan: ValidatedPlan) -> Result<LaunchReport, SupervisorError> {
        info!("Supervisor state: {}", SupervisorState::Installing);
        let programs = self.resolve_programs()?;

        self.layout
            .ensure()
            .map_err(|err| SupervisorError::io(self.layout.root(), err))?;

        let stopped = self.stop_services();
        log_stop_report(&stopped);
        stopped.into_hard_error()?;

        let ValidatedPlan { service, tunnel } = plan;
        service.render().write_to(&self.layout.proxy_config())?;
        InstallSettings {
            identity: service.identity().to_string(),
            listen_port: service.listen_port(),
            tunnel_mode: tunnel.mode(),
            installed_at: Utc::now(),
        }
        .save(&self.layout.install_file())?;
        tunnel.save(&self.layout)?;
        self.forget_hostname()?;
        info!(
            "Installed with identity {} on port {} ({} tunnel)",
            service.identity(),
            service.listen_port(),
            tunnel.mode()
        );

        self.launch_pair(&programs, service, tunnel)
    }

    /// Reports install settings, per-service state and the tunnel endpoint.
    pub fn status(&self) -> Result<StatusReport, SupervisorError> {
        let settings = InstallSettings::require(&self.layout.install_file())?;

        let probe = ServiceProbe::new(&self.records);
        let mut services = Vec::with_capacity(ServiceName::LAUNCH_ORDER.len());
        for name in ServiceName::LAUNCH_ORDER {
            let result = probe.probe(name)?;
            services.push(ServiceStatus::new(
                name,
                result.state,
                result.pid,
                self.log_path(name),
            ));
        }

        let tunnel_running = services
            .iter()
            .any(|status| status.name == ServiceName::Tunnel && status.state.is_running());
        let endpoint = self.current_endpoint(settings.tunnel_mode, tunnel_running)?;
        let states: Vec<_> = services.iter().map(|status| status.state).collect();

        let service = settings.service_config()?;
        Ok(StatusReport {
            state: SupervisorState::derive(true, &states),
            identity: service.identity().to_string(),
            listen_port: service.listen_port(),
            transport_path: service.transport_path().to_string(),
            tunnel_mode: settings.tunnel_mode,
            installed_at: settings.installed_at,
            endpoint,
            services,
        })
    }

    /// Current steady state; never fails on a missing install.
    pub fn state(&self) -> Result<SupervisorState, SupervisorError> {
        if InstallSettings::load(&self.layout.install_file())?.is_none() {
            return Ok(SupervisorState::NotInstalled);
        }
        let probe = ServiceProbe::new(&self.records);
        let states = ServiceName::LAUNCH_ORDER
            .into_iter()
            .map(|name| probe.state(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SupervisorState::derive(true, &states))
    }

    /// Stops both services and relaunches them from the persisted settings.
    ///
    /// Fails with [`ConfigError::MissingInstall`] before touching any process when
    /// nothing was installed.
    pub fn restart(&self) -> Result<LaunchReport, SupervisorError> {
        let settings = InstallSettings::require(&self.layout.install_file())?;
        let service = settings.service_config()?;
        let tunnel = TunnelBinding::load(&self.layout, settings.tunnel_mode)?;
        let programs = self.resolve_programs()?;

        let stopped = self.stop_services();
        log_stop_report(&stopped);
        stopped.into_hard_error()?;

        service.render().write_to(&self.layout.proxy_config())?;
        self.forget_hostname()?;
        info!("Restarting services for identity {}", service.identity());

        self.launch_pair(&programs, service, tunnel)
    }

    /// Stops the tunnel, then the proxy.
    ///
    /// A service that survives SIGKILL is reported in the returned report; its
    /// record is cleared regardless. Other failures are returned as errors after
    /// both services were attempted.
    pub fn stop(&self) -> Result<StopReport, SupervisorError> {
        let report = self.stop_services();
        log_stop_report(&report);
        report.into_hard_error()
    }

    /// Stops both services and removes every persisted artifact.
    ///
    /// Only the directories edgevisor owns are purged; the root itself is removed
    /// when that leaves it empty.
    pub fn uninstall(&self) -> Result<StopReport, SupervisorError> {
        info!("Supervisor state: {}", SupervisorState::Uninstalling);
        let report = self.stop_services();
        log_stop_report(&report);

        for dir in self.layout.owned_dirs() {
            match fs::remove_dir_all(&dir) {
                Ok(()) => info!("Removed {}", dir.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!("Nothing to remove at {}", dir.display())
                }
                Err(err) => return Err(SupervisorError::io(dir, err)),
            }
        }

        // The root goes only when nothing foreign lives in it.
        let root = self.layout.root();
        match fs::remove_dir(root) {
            Ok(()) => info!("Removed {}", root.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => info!("Kept {}: {err}", root.display()),
        }
        info!("Supervisor state: {}", SupervisorState::NotInstalled);
        Ok(report)
    }

    fn resolve_programs(&self) -> Result<Programs, DependencyError> {
        let resolve = |name: ServiceName| {
            if self.install_missing_tools {
                self.tools.resolve_or_install(name.default_program())
            } else {
                self.tools.resolve(name)
            }
        };
        Ok(Programs {
            proxy: resolve(ServiceName::Proxy)?,
            tunnel: resolve(ServiceName::Tunnel)?,
        })
    }

    fn launcher(&self) -> ServiceLauncher<'_> {
        ServiceLauncher::new(&self.records, self.sleeper.as_ref(), self.timings.launch_grace)
    }

    fn terminator(&self) -> ServiceTerminator<'_> {
        ServiceTerminator::new(
            &self.records,
            self.sleeper.as_ref(),
            self.timings.stop_checks,
            self.timings.stop_check_interval,
        )
    }

    fn stop_services(&self) -> StopReport {
        let terminator = self.terminator();
        let entries = ServiceName::STOP_ORDER
            .into_iter()
            .map(|service| {
                let result = terminator.stop(service);
                StopEntry {
                    service,
                    result,
                    finished_at: Instant::now(),
                }
            })
            .collect();
        StopReport { entries }
    }

    /// Launches the proxy, then the tunnel. The tunnel is not attempted when the
    /// proxy fails; nothing already running is rolled back.
    fn launch_pair(
        &self,
        programs: &Programs,
        service: ServiceConfig,
        mut tunnel: TunnelBinding,
    ) -> Result<LaunchReport, SupervisorError> {
        let launcher = self.launcher();

        let proxy_sink = LogSink::new(ServiceName::Proxy, self.log_path(ServiceName::Proxy));
        let proxy = proxy_command(&programs.proxy, &self.layout.proxy_config());
        let proxy_pid = match launcher.start(ServiceName::Proxy, &proxy, &proxy_sink) {
            Ok(LaunchOutcome { pid, .. }) => pid,
            Err(err) => {
                error!("{err}");
                return Err(SupervisorError::PartiallyRunning {
                    failures: vec![err],
                });
            }
        };

        let tunnel_sink = LogSink::new(ServiceName::Tunnel, self.log_path(ServiceName::Tunnel));
        let tail_from = tunnel_sink.len();
        let command = tunnel_command(&programs.tunnel, &tunnel, service.listen_port());
        let tunnel_pid = match launcher.start(ServiceName::Tunnel, &command, &tunnel_sink) {
            Ok(LaunchOutcome { pid, .. }) => pid,
            Err(err) => {
                error!("{err}");
                return Err(SupervisorError::PartiallyRunning {
                    failures: vec![err],
                });
            }
        };

        // Both callers stop the pair first, so the tunnel is always a fresh spawn
        // and its output starts at `tail_from`.
        if tunnel.mode() == TunnelMode::Ephemeral {
            let mut tail = LogTail::from_position(tunnel_sink.path(), tail_from);
            let hostname = EndpointDiscoverer::new(self.sleeper.as_ref(), &self.cancel)
                .discover(&mut tail, self.discovery_budget());
            if let Some(hostname) = hostname {
                self.remember_hostname(&hostname);
                tunnel.record_discovery(hostname);
            }
        }

        Ok(LaunchReport {
            service,
            tunnel,
            proxy_pid,
            tunnel_pid,
        })
    }

    fn discovery_budget(&self) -> DiscoveryBudget {
        DiscoveryBudget {
            interval: self.timings.discovery_interval,
            attempts: self.timings.discovery_attempts,
        }
    }

    fn current_endpoint(
        &self,
        mode: TunnelMode,
        tunnel_running: bool,
    ) -> Result<Endpoint, ConfigError> {
        if mode == TunnelMode::Fixed {
            let binding = TunnelBinding::load(&self.layout, mode)?;
            return Ok(Endpoint {
                hostname: binding.hostname().map(str::to_string),
                source: EndpointSource::Configured,
            });
        }

        if tunnel_running {
            let log = self.log_path(ServiceName::Tunnel);
            if let Some(hostname) = scan_latest_run(&log, &launch_marker(ServiceName::Tunnel)) {
                self.remember_hostname(&hostname);
                return Ok(Endpoint {
                    hostname: Some(hostname),
                    source: EndpointSource::Discovered,
                });
            }
            return Ok(Endpoint::pending());
        }

        Ok(match read_cached_hostname(&self.layout.hostname_cache()) {
            Some(hostname) => Endpoint {
                hostname: Some(hostname),
                source: EndpointSource::Cached,
            },
            None => Endpoint::pending(),
        })
    }

    fn remember_hostname(&self, hostname: &str) {
        let cache = self.layout.hostname_cache();
        if read_cached_hostname(&cache).as_deref() == Some(hostname) {
            return;
        }
        if let Err(err) = write_cached_hostname(&cache, hostname) {
            warn!("Failed to cache hostname in {}: {err}", cache.display());
        }
    }

    fn forget_hostname(&self) -> Result<(), SupervisorError> {
        remove_file_if_exists(&self.layout.hostname_cache())
    }
}

fn remove_file_if_exists(path: &Path) -> Result<(), SupervisorError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SupervisorError::io(path, err)),
    }
}

fn log_stop_report(report: &StopReport) {
    for entry in &report.entries {
        match &entry.result {
            Ok(StopOutcome::AlreadyStopped) => debug!("Service '{}' not running", entry.service),
            Ok(StopOutcome::ClearedStale { pid }) => {
                info!("Cleared stale record for '{}' (PID {pid})", entry.service)
            }
            Ok(StopOutcome::Terminated { pid }) => {
                info!("Stopped '{}' (PID {pid})", entry.service)
            }
            Ok(StopOutcome::Killed { pid }) => {
                warn!("Killed '{}' (PID {pid}) after SIGTERM timed out", entry.service)
            }
            Err(err @ TerminationError::EscalationFailed { .. }) => warn!("{err}"),
            Err(err) => error!("{err}"),
        }
    }
}
