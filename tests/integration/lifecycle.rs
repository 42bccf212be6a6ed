#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    thread,
    time::{Duration, Instant},
};

use common::{
    RecordingSleeper, fast_timings, install_fake_tools, is_process_alive, supervisor,
    wait_for_contents, wait_for_process_exit, write_script,
};
use edgevisor::{
    clock::CancelToken,
    config::ConfigArtifact,
    constants::ServiceName,
    error::{ConfigError, SupervisorError},
    plan::{InstallPlan, TunnelPlan},
    probe::ServiceState,
    status::{EndpointSource, SupervisorState},
    tunnel::TunnelMode,
};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use tempfile::tempdir;

fn ephemeral_plan(identity: &str) -> InstallPlan {
    InstallPlan {
        identity: Some(identity.into()),
        listen_port: Some(30028),
        tunnel: TunnelPlan::default(),
    }
}

#[test]
fn ephemeral_install_discovers_hostname_and_reports_running() {
    let temp = tempdir().unwrap();
    let supervisor = supervisor(temp.path());
    install_fake_tools(supervisor.layout());

    let report = supervisor
        .install(ephemeral_plan("abc-123").validate().unwrap())
        .unwrap();

    let hostname = report.hostname().expect("hostname discovered").to_string();
    assert!(hostname.starts_with("run-"));
    assert!(hostname.ends_with(".trycloudflare.com"));

    let config = ConfigArtifact::read_from(&supervisor.layout().proxy_config()).unwrap();
    assert_eq!(config.transport_path(), Some("/abc-123"));

    let status = supervisor.status().unwrap();
    assert_eq!(status.state, SupervisorState::Running);
    assert_eq!(status.transport_path, "/abc-123");
    assert_eq!(status.tunnel_mode, TunnelMode::Ephemeral);
    assert_eq!(status.endpoint.hostname.as_deref(), Some(hostname.as_str()));
    assert_eq!(status.endpoint.source, EndpointSource::Discovered);
    assert_eq!(
        status.service(ServiceName::Proxy).unwrap().pid,
        Some(report.proxy_pid)
    );

    let records = supervisor.service_records().unwrap();
    assert_eq!(records[1].name, ServiceName::Tunnel);
    assert_eq!(records[1].pid, Some(report.tunnel_pid));
    assert_eq!(records[1].log_path, supervisor.log_path(ServiceName::Tunnel));

    let tunnel_log = wait_for_contents(
        &supervisor.log_path(ServiceName::Tunnel),
        "--url http://localhost:30028",
    );
    assert!(tunnel_log.contains("--edge-ip-version auto --no-autoupdate --protocol http2"));

    supervisor.stop().unwrap();
}

#[test]
fn fixed_install_reports_configured_hostname_without_polling() {
    let temp = tempdir().unwrap();
    let sleeper = RecordingSleeper::default();
    let mut timings = fast_timings();
    timings.discovery_interval = std::time::Duration::from_millis(37);
    let supervisor = supervisor(temp.path())
        .with_timings(timings)
        .with_sleeper(Box::new(sleeper.clone()));
    install_fake_tools(supervisor.layout());

    let plan = InstallPlan {
        identity: Some("abc-123".into()),
        listen_port: Some(30028),
        tunnel: TunnelPlan {
            mode: None,
            token: Some("T".into()),
            hostname: Some("d.example.com".into()),
        },
    };
    let report = supervisor.install(plan.validate().unwrap()).unwrap();
    assert_eq!(report.hostname(), Some("d.example.com"));

    let status = supervisor.status().unwrap();
    assert_eq!(status.tunnel_mode, TunnelMode::Fixed);
    assert_eq!(status.endpoint.hostname.as_deref(), Some("d.example.com"));
    assert_eq!(status.endpoint.source, EndpointSource::Configured);
    assert!(
        !sleeper
            .waits
            .lock()
            .unwrap()
            .contains(&timings.discovery_interval),
        "a fixed tunnel never polls its log"
    );

    let token_path = supervisor.layout().tunnel_token();
    let mode = fs::metadata(&token_path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
    wait_for_contents(&supervisor.log_path(ServiceName::Tunnel), "run --token T");

    supervisor.stop().unwrap();
}

#[test]
fn stop_terminates_tunnel_before_proxy() {
    let temp = tempdir().unwrap();
    let supervisor = supervisor(temp.path());
    install_fake_tools(supervisor.layout());
    let launched = supervisor
        .install(ephemeral_plan("abc-123").validate().unwrap())
        .unwrap();

    let report = supervisor.stop().unwrap();

    assert_eq!(report.order(), vec![ServiceName::Tunnel, ServiceName::Proxy]);
    assert!(report.entries[0].finished_at <= report.entries[1].finished_at);
    assert!(report.survivors().is_empty());
    wait_for_process_exit(launched.tunnel_pid);
    wait_for_process_exit(launched.proxy_pid);

    let status = supervisor.status().unwrap();
    assert_eq!(status.state, SupervisorState::Stopped);
    assert!(
        status
            .services
            .iter()
            .all(|service| service.state == ServiceState::Stopped)
    );
}

#[test]
fn second_install_wins_and_restart_keeps_it() {
    let temp = tempdir().unwrap();
    let supervisor = supervisor(temp.path());
    install_fake_tools(supervisor.layout());

    let first = supervisor
        .install(ephemeral_plan("first-identity").validate().unwrap())
        .unwrap();
    let second = supervisor
        .install(ephemeral_plan("second-identity").validate().unwrap())
        .unwrap();
    assert_ne!(first.proxy_pid, second.proxy_pid);
    wait_for_process_exit(first.proxy_pid);

    let restarted = supervisor.restart().unwrap();
    assert_eq!(restarted.service.identity(), "second-identity");
    assert_ne!(restarted.proxy_pid, second.proxy_pid);

    let config = ConfigArtifact::read_from(&supervisor.layout().proxy_config()).unwrap();
    assert_eq!(config.transport_path(), Some("/second-identity"));
    assert_eq!(supervisor.status().unwrap().identity, "second-identity");

    supervisor.stop().unwrap();
}

#[test]
fn restart_rediscovers_a_fresh_hostname() {
    let temp = tempdir().unwrap();
    let supervisor = supervisor(temp.path());
    install_fake_tools(supervisor.layout());

    let installed = supervisor
        .install(ephemeral_plan("abc-123").validate().unwrap())
        .unwrap();
    let restarted = supervisor.restart().unwrap();

    assert!(installed.hostname().is_some());
    assert!(restarted.hostname().is_some());
    assert_ne!(installed.hostname(), restarted.hostname());
    assert_eq!(
        supervisor.status().unwrap().endpoint.hostname.as_deref(),
        restarted.hostname()
    );

    supervisor.stop().unwrap();
}

#[test]
fn dead_tunnel_leaves_partial_state_and_cached_hostname() {
    let temp = tempdir().unwrap();
    let supervisor = supervisor(temp.path());
    install_fake_tools(supervisor.layout());
    let launched = supervisor
        .install(ephemeral_plan("abc-123").validate().unwrap())
        .unwrap();

    kill(Pid::from_raw(launched.tunnel_pid as i32), Signal::SIGKILL).unwrap();
    wait_for_process_exit(launched.tunnel_pid);

    let status = supervisor.status().unwrap();
    assert_eq!(status.state, SupervisorState::PartiallyRunning);
    assert_eq!(
        status.service(ServiceName::Tunnel).unwrap().state,
        ServiceState::Dead
    );
    assert_eq!(status.endpoint.source, EndpointSource::Cached);
    assert_eq!(status.endpoint.hostname.as_deref(), launched.hostname());

    let report = supervisor.stop().unwrap();
    assert!(report.survivors().is_empty());
    assert_eq!(supervisor.state().unwrap(), SupervisorState::Stopped);
}

#[test]
fn uninstall_stops_services_and_purges_state() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("state");
    let supervisor = supervisor(&root);
    install_fake_tools(supervisor.layout());
    let launched = supervisor
        .install(ephemeral_plan("abc-123").validate().unwrap())
        .unwrap();

    supervisor.uninstall().unwrap();

    wait_for_process_exit(launched.proxy_pid);
    wait_for_process_exit(launched.tunnel_pid);
    assert!(!root.exists());
    assert_eq!(supervisor.state().unwrap(), SupervisorState::NotInstalled);
    assert!(matches!(
        supervisor.restart(),
        Err(SupervisorError::Config(ConfigError::MissingInstall))
    ));
}

#[test]
fn restart_without_install_is_rejected() {
    let temp = tempdir().unwrap();
    let supervisor = supervisor(temp.path());
    install_fake_tools(supervisor.layout());

    assert!(matches!(
        supervisor.restart(),
        Err(SupervisorError::Config(ConfigError::MissingInstall))
    ));
    assert!(!supervisor.layout().pid_file().exists());
    assert!(!supervisor.log_path(ServiceName::Proxy).exists());
}

#[test]
fn tunnel_failure_keeps_proxy_running_without_rollback() {
    let temp = tempdir().unwrap();
    let supervisor = supervisor(temp.path());
    install_fake_tools(supervisor.layout());
    write_script(
        &supervisor.layout().bin_dir().join("cloudflared"),
        "echo 'failed to reach the edge' >&2\nexit 1",
    );

    let err = supervisor
        .install(ephemeral_plan("abc-123").validate().unwrap())
        .unwrap_err();

    assert!(matches!(err, SupervisorError::PartiallyRunning { .. }));
    assert_eq!(err.failed_services(), vec![ServiceName::Tunnel]);
    assert!(err.to_string().contains("tunnel.log"));

    let proxy_pid = supervisor
        .records()
        .get(ServiceName::Proxy)
        .unwrap()
        .expect("proxy stays recorded");
    assert!(is_process_alive(proxy_pid));

    let status = supervisor.status().unwrap();
    assert_eq!(status.state, SupervisorState::PartiallyRunning);
    assert_eq!(
        status.service(ServiceName::Proxy).unwrap().state,
        ServiceState::Running
    );
    assert_eq!(
        status.service(ServiceName::Tunnel).unwrap().state,
        ServiceState::Dead
    );

    supervisor.stop().unwrap();
    wait_for_process_exit(proxy_pid);
}

#[test]
fn cancelled_discovery_leaves_both_services_running() {
    let temp = tempdir().unwrap();
    let cancel = CancelToken::new();
    let mut timings = fast_timings();
    timings.discovery_attempts = 300;
    let supervisor = supervisor(temp.path())
        .with_timings(timings)
        .with_cancel_token(cancel.clone());
    install_fake_tools(supervisor.layout());
    write_script(
        &supervisor.layout().bin_dir().join("cloudflared"),
        "echo 'INF waiting for the edge'\nexec sleep 30",
    );

    let interrupt = thread::spawn(move || {
        thread::sleep(Duration::from_millis(1200));
        cancel.cancel();
    });

    let started = Instant::now();
    let report = supervisor
        .install(ephemeral_plan("abc-123").validate().unwrap())
        .unwrap();
    interrupt.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.hostname(), None);
    assert!(is_process_alive(report.proxy_pid));
    assert!(is_process_alive(report.tunnel_pid));

    let status = supervisor.status().unwrap();
    assert_eq!(status.state, SupervisorState::Running);
    assert_eq!(status.endpoint.source, EndpointSource::Pending);

    supervisor.stop().unwrap();
}

#[test]
fn uninstall_leaves_foreign_files_under_the_root() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("home");
    let supervisor = supervisor(&root);
    install_fake_tools(supervisor.layout());
    let foreign = root.join("Documents/thesis.txt");
    fs::create_dir_all(foreign.parent().unwrap()).unwrap();
    fs::write(&foreign, "chapter one").unwrap();
    let launched = supervisor
        .install(ephemeral_plan("abc-123").validate().unwrap())
        .unwrap();

    supervisor.uninstall().unwrap();

    wait_for_process_exit(launched.tunnel_pid);
    wait_for_process_exit(launched.proxy_pid);
    assert_eq!(fs::read_to_string(&foreign).unwrap(), "chapter one");
    for dir in supervisor.layout().owned_dirs() {
        assert!(!dir.exists(), "{} should be purged", dir.display());
    }
    assert_eq!(supervisor.state().unwrap(), SupervisorState::NotInstalled);
}
