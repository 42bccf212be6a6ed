//! Locating the external executables edgevisor supervises.
use std::{
    env, fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use tracing::{info, warn};

use crate::{constants::ServiceName, error::DependencyError};

/// Package managers tried, in order, when remediation is requested.
const PACKAGE_MANAGERS: &[(&str, &[&str])] = &[
    ("apt-get", &["install", "-y"]),
    ("dnf", &["install", "-y"]),
    ("yum", &["install", "-y"]),
    ("apk", &["add", "--no-cache"]),
];

/// Resolves service executables from the private `bin` directory, then `PATH`.
#[derive(Debug, Clone)]
pub struct ToolResolver {
    bin_dir: PathBuf,
    search_path: Vec<PathBuf>,
}

impl ToolResolver {
    /// Resolver using `bin_dir` and the current `PATH`.
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        let search_path = env::var_os("PATH")
            .map(|paths| env::split_paths(&paths).collect())
            .unwrap_or_default();
        Self::with_search_path(bin_dir, search_path)
    }

    /// Resolver with an explicit search path.
    pub fn with_search_path(bin_dir: impl Into<PathBuf>, search_path: Vec<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            search_path,
        }
    }

    /// Finds the executable for `service`.
    pub fn resolve(&self, service: ServiceName) -> Result<PathBuf, DependencyError> {
        self.resolve_tool(service.default_program())
    }

    /// Finds `tool` in the `bin` directory or on the search path.
    pub fn resolve_tool(&self, tool: &str) -> Result<PathBuf, DependencyError> {
        let candidates: Vec<PathBuf> = std::iter::once(self.bin_dir.join(tool))
            .chain(self.search_path.iter().map(|dir| dir.join(tool)))
            .collect();

        candidates
            .iter()
            .find(|candidate| is_executable(candidate))
            .cloned()
            .ok_or_else(|| DependencyError::DependencyMissing {
                tool: tool.to_string(),
                searched: candidates,
            })
    }

    /// Resolves `tool`, trying a system package manager once if it is missing.
    ///
    /// Remediation is best-effort; when it fails the operator is told to install
    /// the tool manually.
    pub fn resolve_or_install(&self, tool: &str) -> Result<PathBuf, DependencyError> {
        if let Ok(path) = self.resolve_tool(tool) {
            return Ok(path);
        }

        let Some((manager, install_args)) = PACKAGE_MANAGERS
            .iter()
            .find(|(manager, _)| self.resolve_tool(manager).is_ok())
        else {
            warn!("No supported package manager found to install '{tool}'");
            return self.resolve_tool(tool);
        };

        info!("Attempting to install '{tool}' with {manager}");
        let status = Command::new(manager)
            .args(*install_args)
            .arg(tool)
            .stdin(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => self.resolve_tool(tool),
            Ok(status) => Err(DependencyError::RemediationFailed {
                tool: tool.to_string(),
                manager: manager.to_string(),
                detail: status.to_string(),
            }),
            Err(err) => Err(DependencyError::RemediationFailed {
                tool: tool.to_string(),
                manager: manager.to_string(),
                detail: err.to_string(),
            }),
        }
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
