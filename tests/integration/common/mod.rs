#![allow(dead_code)]

use std::{
    env, fs,
    os::unix::fs::PermissionsExt,
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use edgevisor::{
    clock::Sleeper, constants::Timings, deps::ToolResolver, runtime::RuntimeLayout,
    supervisor::Supervisor,
};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Tunnel banner line the fake tunnel client prints, with `$$` expanded per run.
pub const FAKE_TUNNEL_BANNER: &str = "INF |  https://run-$$.trycloudflare.com  |";

pub struct HomeEnvGuard {
    previous: Option<String>,
    _lock: std::sync::MutexGuard<'static, ()>,
}

impl HomeEnvGuard {
    pub fn set(root: &Path) -> Self {
        let lock = edgevisor::test_utils::env_lock();
        let previous = env::var(edgevisor::constants::HOME_ENV).ok();
        unsafe {
            env::set_var(edgevisor::constants::HOME_ENV, root);
        }
        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for HomeEnvGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => unsafe {
                env::set_var(edgevisor::constants::HOME_ENV, value);
            },
            None => unsafe {
                env::remove_var(edgevisor::constants::HOME_ENV);
            },
        }
    }
}

pub fn write_script(path: &Path, body: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Installs stand-ins for both daemons into `<root>/bin`.
///
/// The proxy just sleeps. The tunnel echoes its arguments, prints a fresh
/// hostname banner unless given a token, then sleeps.
pub fn install_fake_tools(layout: &RuntimeLayout) {
    let bin = layout.bin_dir();
    write_script(&bin.join("xray"), "echo \"xray $*\"\nexec sleep 30");
    write_script(
        &bin.join("cloudflared"),
        &format!(
            "echo \"cloudflared $*\"\ncase \"$*\" in\n  *--token*) echo \"INF Registered tunnel connection\" ;;\n  *) echo \"{FAKE_TUNNEL_BANNER}\" ;;\nesac\nexec sleep 30"
        ),
    );
}

pub fn fast_timings() -> Timings {
    Timings {
        launch_grace: Duration::from_millis(300),
        stop_checks: 20,
        stop_check_interval: Duration::from_millis(50),
        discovery_interval: Duration::from_millis(100),
        discovery_attempts: 30,
    }
}

/// Supervisor rooted at `root`, resolving executables from `<root>/bin` only.
pub fn supervisor(root: &Path) -> Supervisor {
    let layout = RuntimeLayout::new(root);
    let tools = ToolResolver::with_search_path(layout.bin_dir(), Vec::new());
    Supervisor::new(layout)
        .with_timings(fast_timings())
        .with_tools(tools)
}

/// Sleeper that records every wait before performing it.
#[derive(Clone, Default)]
pub struct RecordingSleeper {
    pub waits: Arc<Mutex<Vec<Duration>>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.waits.lock().unwrap().push(duration);
        thread::sleep(duration);
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    edgevisor::probe::pid_is_alive(pid)
}

pub fn is_process_listed(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(pid)).is_some()
}

pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("Timed out waiting for PID {pid} to exit");
}

pub fn wait_for_contents(path: &Path, needle: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path)
            && content.contains(needle)
        {
            return content;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for '{needle}' in {:?}", path);
        }

        thread::sleep(Duration::from_millis(50));
    }
}
