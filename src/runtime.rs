//! Runtime paths for persisted state.
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::constants::{
    DEFAULT_HOME_SUFFIX, HOME_ENV, HOSTNAME_CACHE_FILE_NAME, INSTALL_FILE_NAME,
    PID_FILE_NAME, PROXY_CONFIG_FILE_NAME, ServiceName, TUNNEL_BINDING_FILE_NAME,
    TUNNEL_TOKEN_FILE_NAME,
};

/// Directory tree holding every artifact edgevisor persists between invocations.
///
/// ```text
/// <root>/bin     executables
/// <root>/conf    generated config, install settings, tunnel binding, credential
/// <root>/logs    one append-only log per service
/// <root>/run     PID records
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    root: PathBuf,
}

impl RuntimeLayout {
    /// Builds a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves the root from `EDGEVISOR_HOME`, falling back to `$HOME/.local/share/edgevisor`.
    pub fn from_env() -> Self {
        if let Some(explicit) = env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
            return Self::new(PathBuf::from(explicit));
        }

        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::new(home.join(DEFAULT_HOME_SUFFIX))
    }

    /// State root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Executables directory.
    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    /// Configuration directory.
    pub fn conf_dir(&self) -> PathBuf {
        self.root.join("conf")
    }

    /// Log directory.
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// PID record directory.
    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    /// PID record file.
    pub fn pid_file(&self) -> PathBuf {
        self.run_dir().join(PID_FILE_NAME)
    }

    /// Generated proxy daemon config.
    pub fn proxy_config(&self) -> PathBuf {
        self.conf_dir().join(PROXY_CONFIG_FILE_NAME)
    }

    /// Persisted install settings.
    pub fn install_file(&self) -> PathBuf {
        self.conf_dir().join(INSTALL_FILE_NAME)
    }

    /// Persisted fixed-tunnel binding.
    pub fn tunnel_binding(&self) -> PathBuf {
        self.conf_dir().join(TUNNEL_BINDING_FILE_NAME)
    }

    /// Fixed-tunnel credential.
    pub fn tunnel_token(&self) -> PathBuf {
        self.conf_dir().join(TUNNEL_TOKEN_FILE_NAME)
    }

    /// Cache of the last discovered ephemeral hostname.
    pub fn hostname_cache(&self) -> PathBuf {
        self.conf_dir().join(HOSTNAME_CACHE_FILE_NAME)
    }

    /// Log artifact for a service.
    pub fn log_path(&self, service: ServiceName) -> PathBuf {
        self.log_dir().join(format!("{service}.log"))
    }

    /// Directories edgevisor creates under the root and owns outright.
    pub fn owned_dirs(&self) -> [PathBuf; 4] {
        [self.bin_dir(), self.conf_dir(), self.log_dir(), self.run_dir()]
    }

    /// Creates every directory of the tree.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in self.owned_dirs() {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Writes `contents` to a sibling temp file and renames it over `path`.
///
/// Readers observe either the old or the new file, never a partial write.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&temp, contents)?;
    fs::rename(&temp, path)
}
