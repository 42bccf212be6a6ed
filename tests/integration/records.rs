#[path = "common/mod.rs"]
mod common;

use std::{fs, sync::Arc, thread};

use common::HomeEnvGuard;
use edgevisor::{
    constants::ServiceName,
    error::RecordStoreError,
    records::{PidFileStore, ProcessRecordStore},
    runtime::RuntimeLayout,
};
use tempfile::tempdir;

#[test]
fn records_survive_across_store_instances() {
    let temp = tempdir().unwrap();
    let layout = RuntimeLayout::new(temp.path());

    let first = PidFileStore::new(layout.pid_file());
    first.put(ServiceName::Proxy, 4242).unwrap();
    first.put(ServiceName::Tunnel, 4343).unwrap();
    drop(first);

    let second = PidFileStore::new(layout.pid_file());
    assert_eq!(second.get(ServiceName::Proxy).unwrap(), Some(4242));
    assert_eq!(second.get(ServiceName::Tunnel).unwrap(), Some(4343));

    second.clear(ServiceName::Proxy).unwrap();
    second.clear(ServiceName::Proxy).unwrap();
    assert_eq!(
        PidFileStore::new(layout.pid_file())
            .get(ServiceName::Proxy)
            .unwrap(),
        None
    );
}

#[test]
fn concurrent_writers_do_not_lose_records() {
    let temp = tempdir().unwrap();
    let path = Arc::new(temp.path().join("run/pid.json"));

    let handles: Vec<_> = [(ServiceName::Proxy, 10u32), (ServiceName::Tunnel, 20u32)]
        .into_iter()
        .map(|(name, base)| {
            let path = Arc::clone(&path);
            thread::spawn(move || {
                let store = PidFileStore::new(path.as_path());
                for offset in 0..25 {
                    store.put(name, base * 100 + offset).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let entries = PidFileStore::new(path.as_path()).entries().unwrap();
    assert_eq!(entries.get(&ServiceName::Proxy), Some(&1024));
    assert_eq!(entries.get(&ServiceName::Tunnel), Some(&2024));
}

#[test]
fn corrupt_record_file_is_reported() {
    let temp = tempdir().unwrap();
    let layout = RuntimeLayout::new(temp.path());
    fs::create_dir_all(layout.run_dir()).unwrap();
    fs::write(layout.pid_file(), "{ not json").unwrap();

    let store = PidFileStore::new(layout.pid_file());
    assert!(matches!(
        store.get(ServiceName::Proxy),
        Err(RecordStoreError::Parse(_))
    ));
}

#[test]
fn layout_follows_home_override() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("state");
    let _home = HomeEnvGuard::set(&root);

    let layout = RuntimeLayout::from_env();
    assert_eq!(layout.root(), root.as_path());
    assert_eq!(layout.pid_file(), root.join("run/pid.json"));
    assert_eq!(layout.log_path(ServiceName::Tunnel), root.join("logs/tunnel.log"));
}
