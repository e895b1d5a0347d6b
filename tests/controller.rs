#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tsproxy_ctl::{
    Error, OutboundPortMap, PortPool, ProxyConfig, State, TrafficSettings, TrafficUpdate,
    TsProxyLauncher, TsProxyServer,
};

fn emulator() -> TsProxyLauncher {
    TsProxyLauncher::new(env!("CARGO_BIN_EXE_tsproxy-emulator"))
}

fn config() -> ProxyConfig {
    ProxyConfig::new(emulator())
        .with_startup_timeout(Duration::from_secs(10))
        .with_stop_grace_period(Duration::from_secs(2))
}

/// An emulator that appends the commands it receives to a fresh file.
fn logging_emulator(name: &str) -> (TsProxyLauncher, PathBuf) {
    let path = std::env::temp_dir().join(format!(
        "tsproxy-ctl-{}-{}.log",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    let launcher = emulator().with_args([format!("--command-log={}", path.display())]);
    (launcher, path)
}

fn commands_received(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Zombies count as dead: they are only waiting to be reaped.
fn is_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !stat
            .rsplit(')')
            .next()
            .map(|rest| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) if Path::new("/proc/self").exists() => false,
        Err(_) => kill(Pid::from_raw(pid as i32), None).is_ok(),
    }
}

async fn wait_until_dead(pid: u32) -> bool {
    for _ in 0..100 {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_open_and_close_auto_ports() {
    let pool = PortPool::new();
    let mut server = TsProxyServer::open(config(), pool.clone()).await.unwrap();
    assert_eq!(server.state(), State::Ready);
    let port = server.port().expect("port while open");
    assert!(pool.is_in_use(port));
    let pid = server.pid().unwrap();
    assert!(is_alive(pid));
    assert!(server.is_process_alive());
    let command_line = server.command_line().unwrap();
    assert!(command_line.contains(&format!("--port={}", port)), "{}", command_line);

    server.close().await.unwrap();
    assert_eq!(server.state(), State::Closed);
    assert_eq!(server.port(), None);
    assert!(!server.is_process_alive());
    assert!(!is_alive(pid));
    assert!(!pool.is_in_use(port));
}

#[tokio::test]
async fn test_open_with_explicit_data_ports() {
    let launcher = emulator().with_dest_host("127.0.0.1".parse().unwrap());
    let config = ProxyConfig::new(launcher).with_data_ports(37124, 37125);
    let mut server = TsProxyServer::open(config, PortPool::new()).await.unwrap();
    let ports = server.ports().unwrap();
    assert_eq!(ports.outbound, 37124);
    assert_eq!(ports.inbound, 37125);
    assert!(server.port().is_some());
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_port_absent_before_open() {
    let server = TsProxyServer::new(config(), PortPool::new());
    assert_eq!(server.port(), None);
    assert_eq!(server.pid(), None);
}

#[tokio::test]
async fn test_update_outbound_ports() {
    let mut server = TsProxyServer::open(config(), PortPool::new()).await.unwrap();
    server.update_outbound_ports(31242, 14220).await.unwrap();
    assert_eq!(
        server.outbound_port_map(),
        Some(OutboundPortMap::new(31242, 14220).unwrap())
    );
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_update_outbound_ports_invalid() {
    let (launcher, log) = logging_emulator("remap");
    let mut server = TsProxyServer::open(ProxyConfig::new(launcher), PortPool::new())
        .await
        .unwrap();
    server.update_outbound_ports(31242, 14220).await.unwrap();
    assert_eq!(commands_received(&log), ["set mapports 443:14220,*:31242"]);

    for (outbound, inbound) in [(31242, 70000), (0, 14220), (-1, 14220), (80, 80)] {
        let err = server
            .update_outbound_ports(outbound, inbound)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{:?}", err);
    }
    assert!(matches!(
        OutboundPortMap::parse("31242", "abcde"),
        Err(Error::InvalidArgument(_))
    ));

    // Nothing reached the proxy, nothing changed, and the controller is still usable.
    assert_eq!(commands_received(&log), ["set mapports 443:14220,*:31242"]);
    assert_eq!(server.state(), State::Ready);
    assert_eq!(
        server.outbound_port_map(),
        Some(OutboundPortMap::new(31242, 14220).unwrap())
    );
    server.update_outbound_ports(1, 2).await.unwrap();
    assert_eq!(
        commands_received(&log),
        ["set mapports 443:14220,*:31242", "set mapports 443:2,*:1"]
    );

    server.close().await.unwrap();
    let _ = std::fs::remove_file(&log);
}

#[tokio::test]
async fn test_traffic_settings_wire_order() {
    let (launcher, log) = logging_emulator("traffic");
    let mut server = TsProxyServer::open(ProxyConfig::new(launcher), PortPool::new())
        .await
        .unwrap();

    server
        .update_traffic_settings(
            TrafficUpdate::new()
                .upload_bandwidth_kbps(2000)
                .download_bandwidth_kbps(5000)
                .round_trip_latency_ms(100),
        )
        .await
        .unwrap();
    assert_eq!(
        commands_received(&log),
        ["set rtt 100", "set inkbps 5000", "set outkbps 2000"]
    );

    server
        .update_traffic_settings(
            TrafficUpdate::new()
                .round_trip_latency_ms(200)
                .download_bandwidth_kbps(500),
        )
        .await
        .unwrap();
    assert_eq!(
        commands_received(&log)[3..].to_vec(),
        ["set rtt 200", "set inkbps 500"]
    );

    server
        .update_traffic_settings(TrafficUpdate::new())
        .await
        .unwrap();
    assert_eq!(commands_received(&log).len(), 5);
    assert_eq!(server.traffic_settings().upload_bandwidth_kbps, Some(2000));

    server.close().await.unwrap();
    let _ = std::fs::remove_file(&log);
}

#[tokio::test]
async fn test_command_timeout_fails_controller() {
    let launcher = emulator().with_args(["--response-delay-ms=5000"]);
    let config = ProxyConfig::new(launcher)
        .with_command_timeout(Duration::from_millis(300))
        .with_stop_grace_period(Duration::from_secs(2));
    let mut server = TsProxyServer::open(config, PortPool::new()).await.unwrap();
    let pid = server.pid().unwrap();

    let err = server
        .update_traffic_settings(TrafficUpdate::new().round_trip_latency_ms(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CommandTimeout { .. }), "{:?}", err);
    assert!(err.is_fatal());
    assert_eq!(server.state(), State::Failed);
    assert_eq!(server.traffic_settings().round_trip_latency_ms, None);

    server.close().await.unwrap();
    assert!(!is_alive(pid));
}

#[tokio::test]
async fn test_update_traffic_settings() {
    let mut server = TsProxyServer::open(config(), PortPool::new()).await.unwrap();
    server
        .update_traffic_settings(TrafficUpdate::new().round_trip_latency_ms(100))
        .await
        .unwrap();
    server
        .update_traffic_settings(TrafficUpdate::new().download_bandwidth_kbps(5000))
        .await
        .unwrap();
    server
        .update_traffic_settings(TrafficUpdate::new().upload_bandwidth_kbps(2000))
        .await
        .unwrap();
    assert_eq!(
        server.traffic_settings(),
        TrafficSettings {
            round_trip_latency_ms: Some(100),
            download_bandwidth_kbps: Some(5000),
            upload_bandwidth_kbps: Some(2000),
        }
    );

    server
        .update_traffic_settings(
            TrafficUpdate::new()
                .round_trip_latency_ms(200)
                .download_bandwidth_kbps(500),
        )
        .await
        .unwrap();
    assert_eq!(
        server.traffic_settings(),
        TrafficSettings {
            round_trip_latency_ms: Some(200),
            download_bandwidth_kbps: Some(500),
            upload_bandwidth_kbps: Some(2000),
        }
    );

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_download_only_scenario() {
    let mut server = TsProxyServer::open(config(), PortPool::new()).await.unwrap();
    assert!(server.port().is_some());
    let pid = server.pid().unwrap();

    server
        .update_traffic_settings(TrafficUpdate::new().download_bandwidth_kbps(5000))
        .await
        .unwrap();
    let settings = server.traffic_settings();
    assert_eq!(settings.download_bandwidth_kbps, Some(5000));
    assert_eq!(settings.round_trip_latency_ms, None);
    assert_eq!(settings.upload_bandwidth_kbps, None);

    server.close().await.unwrap();
    assert!(!is_alive(pid));
}

#[tokio::test]
async fn test_close_twice() {
    let mut server = TsProxyServer::open(config(), PortPool::new()).await.unwrap();
    let pid = server.pid().unwrap();
    server.close().await.unwrap();
    assert_eq!(server.pid(), None);
    server.close().await.unwrap();
    assert_eq!(server.state(), State::Closed);
    assert!(!is_alive(pid));

    let err = server
        .update_traffic_settings(TrafficUpdate::new().round_trip_latency_ms(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotOpen(State::Closed)));
}

#[tokio::test]
async fn test_concurrent_distinct_explicit_ports() {
    let pool = PortPool::new();
    let ports = pool.allocate(6).unwrap();
    let first = config()
        .with_control_port(ports[0])
        .with_data_ports(ports[1], ports[2]);
    let second = config()
        .with_control_port(ports[3])
        .with_data_ports(ports[4], ports[5]);

    let (first, second) = tokio::join!(
        TsProxyServer::open(first, pool.clone()),
        TsProxyServer::open(second, pool.clone())
    );
    let mut first = first.unwrap();
    let mut second = second.unwrap();
    assert_eq!(first.port(), Some(ports[0]));
    assert_eq!(second.port(), Some(ports[3]));

    first
        .update_traffic_settings(TrafficUpdate::new().round_trip_latency_ms(10))
        .await
        .unwrap();
    second
        .update_traffic_settings(TrafficUpdate::new().round_trip_latency_ms(20))
        .await
        .unwrap();

    first.close().await.unwrap();
    second.close().await.unwrap();
    pool.release(&ports);
}

#[tokio::test]
async fn test_same_explicit_ports_conflict() {
    let ports = PortPool::new().allocate(3).unwrap();
    let config = config()
        .with_control_port(ports[0])
        .with_data_ports(ports[1], ports[2]);

    let mut first = TsProxyServer::open(config.clone(), PortPool::new())
        .await
        .unwrap();
    let err = TsProxyServer::open(config, PortPool::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Startup(_) | Error::Connection { .. }),
        "{:?}",
        err
    );

    // The first proxy is unaffected.
    first
        .update_traffic_settings(TrafficUpdate::new().upload_bandwidth_kbps(100))
        .await
        .unwrap();
    first.close().await.unwrap();
}

#[tokio::test]
async fn test_process_death_fails_controller() {
    let mut server = TsProxyServer::open(config(), PortPool::new()).await.unwrap();
    let pid = server.pid().unwrap();
    server
        .update_traffic_settings(TrafficUpdate::new().round_trip_latency_ms(100))
        .await
        .unwrap();

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    assert!(wait_until_dead(pid).await);

    let err = server
        .update_traffic_settings(TrafficUpdate::new().round_trip_latency_ms(200))
        .await
        .unwrap_err();
    assert!(err.is_fatal(), "{:?}", err);
    assert_eq!(server.state(), State::Failed);
    assert_eq!(server.port(), None);
    assert_eq!(server.traffic_settings().round_trip_latency_ms, Some(100));

    let err = server.update_outbound_ports(1, 2).await.unwrap_err();
    assert!(matches!(err, Error::NotOpen(State::Failed)));

    server.close().await.unwrap();
    assert_eq!(server.state(), State::Closed);
}

#[tokio::test]
async fn test_startup_timeout() {
    let launcher = emulator().with_args(["--startup-delay-ms=5000"]);
    let config = ProxyConfig::new(launcher)
        .with_startup_timeout(Duration::from_millis(300))
        .with_stop_grace_period(Duration::from_secs(2));
    let mut server = TsProxyServer::new(config, PortPool::new());
    let err = server.start().await.unwrap_err();
    assert!(matches!(err, Error::StartupTimeout(_)), "{:?}", err);
    assert_eq!(server.state(), State::Failed);
    assert_eq!(server.pid(), None);
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_startup_error_reports_diagnostics() {
    let launcher = emulator().with_args(["--no-such-flag"]);
    let err = TsProxyServer::open(ProxyConfig::new(launcher), PortPool::new())
        .await
        .unwrap_err();
    match err {
        Error::Startup(message) => assert!(message.contains("exited with"), "{}", message),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_drop_without_close_kills_process() {
    let pool = PortPool::new();
    let server = TsProxyServer::open(config(), pool.clone()).await.unwrap();
    let pid = server.pid().unwrap();
    let port = server.port().unwrap();
    drop(server);

    assert!(wait_until_dead(pid).await);
    assert!(!pool.is_in_use(port));
}
