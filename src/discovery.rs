//! Discovery of the public hostname assigned to an ephemeral tunnel.
use std::{
    fs,
    io::ErrorKind,
    path::Path,
    sync::LazyLock,
    time::Duration,
};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    clock::{CancelToken, Sleeper},
    constants::{EPHEMERAL_API_HOST, EPHEMERAL_DOMAIN_SUFFIX, EPHEMERAL_HOSTNAME_PATTERN},
    logs::{LogSource, LogTail, last_offset_of},
    runtime::write_atomic,
};

static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(EPHEMERAL_HOSTNAME_PATTERN).expect("ephemeral hostname pattern is valid")
});

/// Extracts the first well-formed ephemeral tunnel hostname from `line`.
pub fn find_hostname(line: &str) -> Option<String> {
    HOSTNAME_RE
        .captures_iter(line)
        .filter_map(|caps| caps.get(1))
        .map(|host| host.as_str().to_string())
        .find(|host| host != EPHEMERAL_API_HOST && host.ends_with(EPHEMERAL_DOMAIN_SUFFIX))
}

/// How long discovery may keep polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryBudget {
    /// Pause between polls.
    pub interval: Duration,
    /// Polls before giving up.
    pub attempts: usize,
}

/// Polls a tunnel log until the assigned hostname shows up.
///
/// Running out of budget is not an error: the hostname is reported as pending and
/// `status` can pick it up later.
pub struct EndpointDiscoverer<'a> {
    sleeper: &'a dyn Sleeper,
    cancel: &'a CancelToken,
}

impl<'a> EndpointDiscoverer<'a> {
    /// Creates a discoverer.
    pub fn new(sleeper: &'a dyn Sleeper, cancel: &'a CancelToken) -> Self {
        Self { sleeper, cancel }
    }

    /// Polls `source` up to `budget.attempts` times.
    ///
    /// The first poll happens immediately; cancellation is checked between polls.
    pub fn discover(&self, source: &mut dyn LogSource, budget: DiscoveryBudget) -> Option<String> {
        for attempt in 1..=budget.attempts {
            match source.read_new_lines() {
                Ok(lines) => {
                    if let Some(hostname) = lines.iter().find_map(|line| find_hostname(line)) {
                        info!("Discovered tunnel hostname {hostname} after {attempt} poll(s)");
                        return Some(hostname);
                    }
                }
                Err(err) => warn!("Failed to read tunnel log (poll {attempt}): {err}"),
            }

            if attempt == budget.attempts {
                break;
            }
            if self.cancel.is_cancelled() {
                info!("Hostname discovery cancelled after {attempt} poll(s)");
                return None;
            }
            debug!("No tunnel hostname yet (poll {attempt}/{})", budget.attempts);
            self.sleeper.sleep(budget.interval);
        }

        warn!(
            "Tunnel hostname not found after {} poll(s); discovery pending",
            budget.attempts
        );
        None
    }
}

/// Scans the most recent run recorded in a log for a hostname, without waiting.
///
/// Only lines after the last launch marker are considered so a hostname from an
/// earlier run is never reported.
pub fn scan_latest_run(path: &Path, marker: &str) -> Option<String> {
    let start = match last_offset_of(path, marker) {
        Ok(offset) => offset.unwrap_or(0),
        Err(err) if err.kind() == ErrorKind::NotFound => return None,
        Err(err) => {
            warn!("Failed to scan {}: {err}", path.display());
            return None;
        }
    };

    match LogTail::from_position(path, start).read_new_lines() {
        Ok(lines) => lines.iter().find_map(|line| find_hostname(line)),
        Err(err) => {
            warn!("Failed to read {}: {err}", path.display());
            None
        }
    }
}

/// Reads the cached hostname from a previous discovery.
pub fn read_cached_hostname(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let hostname = contents.trim();
            (!hostname.is_empty()).then(|| hostname.to_string())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => {
            warn!("Failed to read hostname cache {}: {err}", path.display());
            None
        }
    }
}

/// Caches a discovered hostname for later `status` calls.
pub fn write_cached_hostname(path: &Path, hostname: &str) -> std::io::Result<()> {
    write_atomic(path, format!("{hostname}\n").as_bytes())
}
