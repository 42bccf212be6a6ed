//! Durable PID records for managed services.
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    constants::{PID_LOCK_SUFFIX, ServiceName},
    error::RecordStoreError,
    runtime::write_atomic,
};

/// Repository of "this service is supposed to be running with this PID".
///
/// A record is never proof of liveness on its own; see [`crate::probe`].
pub trait ProcessRecordStore {
    /// Replaces the record for `name`.
    fn put(&self, name: ServiceName, pid: u32) -> Result<(), RecordStoreError>;

    /// Returns the recorded PID, if any.
    fn get(&self, name: ServiceName) -> Result<Option<u32>, RecordStoreError>;

    /// Removes the record for `name`. Clearing an absent record is a no-op.
    fn clear(&self, name: ServiceName) -> Result<(), RecordStoreError>;
}

/// Snapshot of a managed service's persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Service the record belongs to.
    pub name: ServiceName,
    /// Recorded PID, absent when never started or already stopped.
    pub pid: Option<u32>,
    /// Log artifact for the service.
    pub log_path: PathBuf,
}

/// On-disk shape of the PID file.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
struct PidRecords {
    services: BTreeMap<ServiceName, u32>,
}

/// JSON-file backed record store.
///
/// Every call reloads the file under an exclusive lock, so separate invocations of
/// the CLI always observe each other's writes.
#[derive(Debug, Clone)]
pub struct PidFileStore {
    path: PathBuf,
}

impl PidFileStore {
    /// Creates a store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns every recorded service and PID.
    pub fn entries(&self) -> Result<BTreeMap<ServiceName, u32>, RecordStoreError> {
        let _lock = self.lock()?;
        Ok(self.load()?.services)
    }

    fn lock(&self) -> Result<File, RecordStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut lock_path = self.path.clone().into_os_string();
        lock_path.push(PID_LOCK_SUFFIX);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(PathBuf::from(lock_path))?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn load(&self) -> Result<PidRecords, RecordStoreError> {
        if !self.path.exists() {
            return Ok(PidRecords::default());
        }

        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(PidRecords::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, records: &PidRecords) -> Result<(), RecordStoreError> {
        let serialized = serde_json::to_string_pretty(records)?;
        write_atomic(&self.path, serialized.as_bytes())?;
        Ok(())
    }
}

impl ProcessRecordStore for PidFileStore {
    fn put(&self, name: ServiceName, pid: u32) -> Result<(), RecordStoreError> {
        let _lock = self.lock()?;
        let mut records = self.load()?;
        records.services.insert(name, pid);
        self.save(&records)?;
        debug!("Recorded PID {pid} for '{name}'");
        Ok(())
    }

    fn get(&self, name: ServiceName) -> Result<Option<u32>, RecordStoreError> {
        let _lock = self.lock()?;
        Ok(self.load()?.services.get(&name).copied())
    }

    fn clear(&self, name: ServiceName) -> Result<(), RecordStoreError> {
        let _lock = self.lock()?;
        let mut records = self.load()?;
        if records.services.remove(&name).is_some() {
            self.save(&records)?;
            debug!("Cleared PID record for '{name}'");
        } else {
            debug!("Service '{name}' already cleared from PID records");
        }
        Ok(())
    }
}

/// Volatile record store, useful where persistence is irrelevant.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    services: Mutex<BTreeMap<ServiceName, u32>>,
}

impl ProcessRecordStore for MemoryRecordStore {
    fn put(&self, name: ServiceName, pid: u32) -> Result<(), RecordStoreError> {
        self.services.lock()?.insert(name, pid);
        Ok(())
    }

    fn get(&self, name: ServiceName) -> Result<Option<u32>, RecordStoreError> {
        Ok(self.services.lock()?.get(&name).copied())
    }

    fn clear(&self, name: ServiceName) -> Result<(), RecordStoreError> {
        self.services.lock()?.remove(&name);
        Ok(())
    }
}
