#[path = "common/mod.rs"]
mod common;

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use edgevisor::{
    clock::{CancelToken, ThreadSleeper},
    discovery::{DiscoveryBudget, EndpointDiscoverer},
    logs::LogTail,
};
use tempfile::tempdir;

fn append(path: &Path, text: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

#[test]
fn discovers_hostname_written_while_polling() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("tunnel.log");
    append(&path, "INF Starting tunnel\n");

    let writer_path = path.clone();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        append(&writer_path, "INF Requesting new quick Tunnel on trycloudflare.com...\n");
        append(&writer_path, "INF |  https://quiet-river-");
        thread::sleep(Duration::from_millis(100));
        append(&writer_path, "1234.trycloudflare.com  |\n");
    });

    let sleeper = ThreadSleeper;
    let cancel = CancelToken::new();
    let budget = DiscoveryBudget {
        interval: Duration::from_millis(50),
        attempts: 40,
    };
    let mut tail = LogTail::new(&path);
    let found = EndpointDiscoverer::new(&sleeper, &cancel).discover(&mut tail, budget);
    writer.join().unwrap();

    assert_eq!(found.as_deref(), Some("quiet-river-1234.trycloudflare.com"));
}

#[test]
fn output_before_the_tail_position_is_ignored() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("tunnel.log");
    append(&path, "INF |  https://previous-run.trycloudflare.com  |\n");
    let offset = fs::metadata(&path).unwrap().len();
    append(&path, "INF Starting tunnel\n");

    let sleeper = ThreadSleeper;
    let cancel = CancelToken::new();
    let budget = DiscoveryBudget {
        interval: Duration::from_millis(20),
        attempts: 3,
    };
    let mut tail = LogTail::from_position(&path, offset);

    assert_eq!(
        EndpointDiscoverer::new(&sleeper, &cancel).discover(&mut tail, budget),
        None
    );
}

#[test]
fn missing_log_exhausts_the_budget() {
    let temp = tempdir().unwrap();
    let sleeper = ThreadSleeper;
    let cancel = CancelToken::new();
    let budget = DiscoveryBudget {
        interval: Duration::from_millis(20),
        attempts: 5,
    };
    let mut tail = LogTail::new(temp.path().join("never-created.log"));

    let started = Instant::now();
    let found = EndpointDiscoverer::new(&sleeper, &cancel).discover(&mut tail, budget);

    assert_eq!(found, None);
    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[test]
fn cancellation_from_another_thread_ends_discovery_early() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("tunnel.log");
    let sleeper = ThreadSleeper;
    let cancel = CancelToken::new();
    let budget = DiscoveryBudget {
        interval: Duration::from_millis(50),
        attempts: 200,
    };

    let handler_copy = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(120));
        handler_copy.cancel();
    });

    let started = Instant::now();
    let mut tail = LogTail::new(&path);
    let found = EndpointDiscoverer::new(&sleeper, &cancel).discover(&mut tail, budget);
    canceller.join().unwrap();

    assert_eq!(found, None);
    assert!(started.elapsed() < Duration::from_secs(5));
}
