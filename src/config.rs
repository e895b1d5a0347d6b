use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "bin")]
use anyhow::Context;

use crate::error::{Error, Result};
use crate::server::{OutboundPortMap, TrafficUpdate};
use crate::supervisor::{Launcher, TsProxyLauncher};

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The ports a proxy process is started with. Fixed for the life of the process.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PortBinding {
    /// Port of the control channel.
    pub control: u16,
    /// Port non-HTTPS traffic is forwarded to.
    pub outbound: u16,
    /// Port HTTPS traffic is forwarded to.
    pub inbound: u16,
}

impl Display for PortBinding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "control={} outbound={} inbound={}",
            self.control, self.outbound, self.inbound
        )
    }
}

/// How to start and talk to a proxy process.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Builds the process command line.
    pub launcher: Arc<dyn Launcher>,
    /// Control port. Allocated from the port pool when `None`.
    pub control_port: Option<u16>,
    /// Outbound data port. Must be set together with `inbound_port`.
    pub outbound_port: Option<u16>,
    /// Inbound data port. Must be set together with `outbound_port`.
    pub inbound_port: Option<u16>,
    /// Upper bound for the process to answer the liveness probe.
    pub startup_timeout: Duration,
    /// Upper bound for a single command round-trip.
    pub command_timeout: Duration,
    /// How long a process gets to exit after being interrupted before it is killed.
    pub stop_grace_period: Duration,
    /// Delay between readiness probes.
    pub poll_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new(TsProxyLauncher::new("tsproxy"))
    }
}

impl ProxyConfig {
    pub fn new(launcher: impl Launcher + 'static) -> Self {
        Self {
            launcher: Arc::new(launcher),
            control_port: None,
            outbound_port: None,
            inbound_port: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            stop_grace_period: DEFAULT_STOP_GRACE_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_control_port(mut self, port: u16) -> Self {
        self.control_port = Some(port);
        self
    }

    pub fn with_data_ports(mut self, outbound: u16, inbound: u16) -> Self {
        self.outbound_port = Some(outbound);
        self.inbound_port = Some(inbound);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    /// Checks the explicitly given ports.
    pub fn validate(&self) -> Result<()> {
        if self.control_port == Some(0)
            || self.outbound_port == Some(0)
            || self.inbound_port == Some(0)
        {
            return Err(Error::InvalidArgument("port 0 cannot be bound explicitly".into()));
        }
        match (self.outbound_port, self.inbound_port) {
            (Some(outbound), Some(inbound)) if outbound == inbound => Err(Error::InvalidArgument(
                format!("outbound and inbound ports must differ (both {})", outbound),
            )),
            (Some(_), None) | (None, Some(_)) => Err(Error::InvalidArgument(
                "outbound and inbound ports must be given together".into(),
            )),
            _ => Ok(()),
        }
    }

    /// How many ports have to come from the port pool.
    pub(crate) fn missing_ports(&self) -> usize {
        usize::from(self.control_port.is_none()) + 2 * usize::from(self.outbound_port.is_none())
    }
}

/// Command-line configuration of the `tsproxy-ctl` binary.
#[derive(Clone, Debug)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub traffic: TrafficUpdate,
    pub port_map: Option<OutboundPortMap>,
    pub log: String,
}

#[cfg(feature = "bin")]
impl Config {
    pub fn from_args() -> anyhow::Result<Self> {
        use std::net::IpAddr;
        use std::path::PathBuf;

        use clap::{Arg, ArgAction, Command};

        let matches = Command::new("tsproxy-ctl")
            .version(env!("CARGO_PKG_VERSION"))
            .args(&[
                Arg::new("proxy-bin")
                    .long("proxy-bin")
                    .env("TSPROXY_BIN")
                    .default_value("tsproxy")
                    .help("The traffic-shaping proxy program to run."),
                Arg::new("proxy-arg")
                    .long("proxy-arg")
                    .action(ArgAction::Append)
                    .help("Extra argument placed before the port arguments (e.g. the script path for an interpreter). Can be repeated."),
                Arg::new("desthost")
                    .long("desthost")
                    .env("TSPROXY_DESTHOST")
                    .help("Redirect every proxied connection to this IP. Example: 127.0.0.1"),
                Arg::new("port")
                    .long("port")
                    .env("TSPROXY_PORT")
                    .help("The control port. A free port is picked when omitted."),
                Arg::new("outbound-port")
                    .long("outbound-port")
                    .env("TSPROXY_OUTBOUND_PORT")
                    .requires("inbound-port")
                    .help("Data port for non-HTTPS traffic. Must be given with --inbound-port."),
                Arg::new("inbound-port")
                    .long("inbound-port")
                    .env("TSPROXY_INBOUND_PORT")
                    .requires("outbound-port")
                    .help("Data port for HTTPS traffic. Must be given with --outbound-port."),
                Arg::new("rtt")
                    .long("rtt")
                    .env("TSPROXY_RTT")
                    .help("Round-trip latency to apply, in milliseconds."),
                Arg::new("inkbps")
                    .long("inkbps")
                    .env("TSPROXY_INKBPS")
                    .help("Download bandwidth cap to apply, in kbps."),
                Arg::new("outkbps")
                    .long("outkbps")
                    .env("TSPROXY_OUTKBPS")
                    .help("Upload bandwidth cap to apply, in kbps."),
                Arg::new("map-ports")
                    .long("map-ports")
                    .env("TSPROXY_MAP_PORTS")
                    .help("Outbound port override, as OUT,IN. Example: 31242,14220"),
                Arg::new("startup-timeout-ms")
                    .long("startup-timeout-ms")
                    .env("TSPROXY_STARTUP_TIMEOUT_MS")
                    .help("How long to wait for the proxy to become ready."),
                Arg::new("log")
                    .long("log")
                    .env("TSPROXY_LOG")
                    .default_value("info")
                    .help("Configures the log level and format."),
            ])
            .get_matches();

        let mut launcher = TsProxyLauncher::new(
            matches
                .get_one::<String>("proxy-bin")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tsproxy")),
        );
        if let Some(args) = matches.get_many::<String>("proxy-arg") {
            launcher = launcher.with_args(args.cloned());
        }
        if let Some(host) = matches.get_one::<String>("desthost") {
            launcher = launcher.with_dest_host(
                host.parse::<IpAddr>()
                    .with_context(|| "Invalid destination host")?,
            );
        }

        let mut proxy = ProxyConfig::new(launcher);
        proxy.control_port = parse_optional(matches.get_one::<String>("port"))
            .with_context(|| "Invalid control port")?;
        proxy.outbound_port = parse_optional(matches.get_one::<String>("outbound-port"))
            .with_context(|| "Invalid outbound port")?;
        proxy.inbound_port = parse_optional(matches.get_one::<String>("inbound-port"))
            .with_context(|| "Invalid inbound port")?;
        if let Some(ms) = parse_optional::<u64>(matches.get_one::<String>("startup-timeout-ms"))
            .with_context(|| "Invalid startup timeout")?
        {
            proxy.startup_timeout = Duration::from_millis(ms);
        }
        proxy.validate().with_context(|| "Invalid proxy ports")?;

        let traffic = TrafficUpdate {
            round_trip_latency_ms: parse_optional(matches.get_one::<String>("rtt"))
                .with_context(|| "Invalid round-trip latency")?,
            download_bandwidth_kbps: parse_optional(matches.get_one::<String>("inkbps"))
                .with_context(|| "Invalid download bandwidth")?,
            upload_bandwidth_kbps: parse_optional(matches.get_one::<String>("outkbps"))
                .with_context(|| "Invalid upload bandwidth")?,
        };

        let port_map = matches
            .get_one::<String>("map-ports")
            .map(|s| s.parse::<OutboundPortMap>())
            .transpose()
            .with_context(|| "Invalid port map")?;

        Ok(Self {
            proxy,
            traffic,
            port_map,
            log: matches
                .get_one::<String>("log")
                .cloned()
                .unwrap_or_else(|| "info".into()),
        })
    }
}

#[cfg(feature = "bin")]
fn parse_optional<T>(s: Option<&String>) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    s.map(|s| s.parse::<T>())
        .transpose()
        .with_context(|| format!("{:?} is not a valid number", s))
}
