#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Duration};

use common::{is_process_alive, wait_for_process_exit};
use edgevisor::{
    clock::ThreadSleeper,
    constants::ServiceName,
    error::LaunchError,
    launcher::{ServiceCommand, ServiceLauncher},
    logs::LogSink,
    probe::{ServiceProbe, ServiceState},
    records::{MemoryRecordStore, PidFileStore, ProcessRecordStore},
    terminator::{ServiceTerminator, StopOutcome},
};
use tempfile::tempdir;

const GRACE: Duration = Duration::from_millis(300);

fn sleeper_command() -> ServiceCommand {
    ServiceCommand::new("sleep").arg("30")
}

fn terminator<'a>(
    records: &'a dyn ProcessRecordStore,
    sleeper: &'a ThreadSleeper,
) -> ServiceTerminator<'a> {
    ServiceTerminator::new(records, sleeper, 10, Duration::from_millis(50))
}

#[test]
fn start_is_idempotent_while_running() {
    let temp = tempdir().unwrap();
    let records = PidFileStore::new(temp.path().join("run/pid.json"));
    let sleeper = ThreadSleeper;
    let launcher = ServiceLauncher::new(&records, &sleeper, GRACE);
    let sink = LogSink::new(ServiceName::Proxy, temp.path().join("logs/proxy.log"));

    let first = launcher
        .start(ServiceName::Proxy, &sleeper_command(), &sink)
        .unwrap();
    let second = launcher
        .start(ServiceName::Proxy, &sleeper_command(), &sink)
        .unwrap();

    assert!(!first.reused);
    assert!(second.reused);
    assert_eq!(first.pid, second.pid);
    assert_eq!(records.get(ServiceName::Proxy).unwrap(), Some(first.pid));

    terminator(&records, &sleeper).stop(ServiceName::Proxy).unwrap();
}

#[test]
fn stop_then_probe_reports_stopped() {
    let temp = tempdir().unwrap();
    let records = PidFileStore::new(temp.path().join("run/pid.json"));
    let sleeper = ThreadSleeper;
    let launcher = ServiceLauncher::new(&records, &sleeper, GRACE);
    let sink = LogSink::new(ServiceName::Tunnel, temp.path().join("logs/tunnel.log"));

    let outcome = launcher
        .start(ServiceName::Tunnel, &sleeper_command(), &sink)
        .unwrap();
    let probe = ServiceProbe::new(&records);
    assert_eq!(probe.probe(ServiceName::Tunnel).unwrap().state, ServiceState::Running);

    let stopped = terminator(&records, &sleeper).stop(ServiceName::Tunnel).unwrap();

    assert_eq!(stopped, StopOutcome::Terminated { pid: outcome.pid });
    assert_eq!(probe.probe(ServiceName::Tunnel).unwrap().state, ServiceState::Stopped);
    wait_for_process_exit(outcome.pid);

    assert_eq!(
        terminator(&records, &sleeper).stop(ServiceName::Tunnel).unwrap(),
        StopOutcome::AlreadyStopped
    );
}

#[test]
fn sigterm_ignoring_service_is_killed() {
    let temp = tempdir().unwrap();
    let records = MemoryRecordStore::default();
    let sleeper = ThreadSleeper;
    let launcher = ServiceLauncher::new(&records, &sleeper, GRACE);
    let sink = LogSink::new(ServiceName::Proxy, temp.path().join("logs/proxy.log"));
    let stubborn = ServiceCommand::new("sh")
        .arg("-c")
        .arg("trap '' TERM; exec sleep 30");

    let outcome = launcher.start(ServiceName::Proxy, &stubborn, &sink).unwrap();
    let stopped = terminator(&records, &sleeper).stop(ServiceName::Proxy).unwrap();

    assert_eq!(stopped, StopOutcome::Killed { pid: outcome.pid });
    assert_eq!(records.get(ServiceName::Proxy).unwrap(), None);
    assert!(!is_process_alive(outcome.pid));
}

#[test]
fn service_exiting_during_grace_is_reported_with_its_log() {
    let temp = tempdir().unwrap();
    let records = MemoryRecordStore::default();
    let sleeper = ThreadSleeper;
    let launcher = ServiceLauncher::new(&records, &sleeper, GRACE);
    let sink = LogSink::new(ServiceName::Proxy, temp.path().join("logs/proxy.log"));
    let failing = ServiceCommand::new("sh")
        .arg("-c")
        .arg("echo 'Failed to read config' >&2; exit 23");

    let err = launcher.start(ServiceName::Proxy, &failing, &sink).unwrap_err();

    match &err {
        LaunchError::ExitedDuringGrace { service, log, .. } => {
            assert_eq!(*service, ServiceName::Proxy);
            assert_eq!(log, sink.path());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let log = fs::read_to_string(sink.path()).unwrap();
    assert!(log.contains("Failed to read config"));

    let probe = ServiceProbe::new(&records);
    assert_eq!(probe.probe(ServiceName::Proxy).unwrap().state, ServiceState::Dead);
}

#[test]
fn stale_record_is_cleared_without_signalling() {
    let records = MemoryRecordStore::default();
    let sleeper = ThreadSleeper;
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    records.put(ServiceName::Tunnel, pid).unwrap();

    let stopped = terminator(&records, &sleeper).stop(ServiceName::Tunnel).unwrap();

    assert_eq!(stopped, StopOutcome::ClearedStale { pid });
    assert_eq!(records.get(ServiceName::Tunnel).unwrap(), None);
}

#[test]
fn dead_service_is_relaunched_with_a_new_pid() {
    let temp = tempdir().unwrap();
    let records = MemoryRecordStore::default();
    let sleeper = ThreadSleeper;
    let sink = LogSink::new(ServiceName::Proxy, temp.path().join("logs/proxy.log"));

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let stale = child.id();
    child.wait().unwrap();
    records.put(ServiceName::Proxy, stale).unwrap();

    let launcher = ServiceLauncher::new(&records, &sleeper, GRACE);
    let outcome = launcher
        .start(ServiceName::Proxy, &sleeper_command(), &sink)
        .unwrap();

    assert!(!outcome.reused);
    assert_eq!(records.get(ServiceName::Proxy).unwrap(), Some(outcome.pid));

    terminator(&records, &sleeper).stop(ServiceName::Proxy).unwrap();
}
