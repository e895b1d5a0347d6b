//! The public controller for a traffic-shaping proxy process.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::channel::ControlChannel;
use crate::config::{PortBinding, ProxyConfig};
use crate::error::{Error, Result};
use crate::port_pool::PortPool;
use crate::protocol::Command;
use crate::supervisor::{control_addr, ProxyProcess, Supervisor};

/// Lifecycle of a [`TsProxyServer`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    Unopened,
    Starting,
    Ready,
    /// Startup or the control channel failed. Only `close` is allowed.
    Failed,
    Closed,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Last successfully applied traffic-shaping values. `None` means never set.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct TrafficSettings {
    pub round_trip_latency_ms: Option<u32>,
    pub download_bandwidth_kbps: Option<u32>,
    pub upload_bandwidth_kbps: Option<u32>,
}

/// A partial update of [`TrafficSettings`]. Fields left `None` are neither sent nor reset.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct TrafficUpdate {
    pub round_trip_latency_ms: Option<u32>,
    pub download_bandwidth_kbps: Option<u32>,
    pub upload_bandwidth_kbps: Option<u32>,
}

impl TrafficUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn round_trip_latency_ms(mut self, ms: u32) -> Self {
        self.round_trip_latency_ms = Some(ms);
        self
    }

    pub fn download_bandwidth_kbps(mut self, kbps: u32) -> Self {
        self.download_bandwidth_kbps = Some(kbps);
        self
    }

    pub fn upload_bandwidth_kbps(mut self, kbps: u32) -> Self {
        self.upload_bandwidth_kbps = Some(kbps);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Outbound/inbound data port override. Both ports are in 1-65535 and differ.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct OutboundPortMap {
    outbound: u16,
    inbound: u16,
}

impl OutboundPortMap {
    pub fn new(outbound: i64, inbound: i64) -> Result<Self> {
        let outbound = checked_port("outbound", outbound)?;
        let inbound = checked_port("inbound", inbound)?;
        if outbound == inbound {
            return Err(Error::InvalidArgument(format!(
                "outbound and inbound ports must differ (both {})",
                outbound
            )));
        }
        Ok(Self { outbound, inbound })
    }

    /// Validates textual ports, e.g. as read from a command line.
    pub fn parse(outbound: &str, inbound: &str) -> Result<Self> {
        Self::new(
            numeric_port("outbound", outbound)?,
            numeric_port("inbound", inbound)?,
        )
    }

    pub fn outbound(&self) -> u16 {
        self.outbound
    }

    pub fn inbound(&self) -> u16 {
        self.inbound
    }
}

impl Display for OutboundPortMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.outbound, self.inbound)
    }
}

/// Parses `OUT,IN`.
impl FromStr for OutboundPortMap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (outbound, inbound) = s.split_once(',').ok_or_else(|| {
            Error::InvalidArgument(format!("port map {:?} is not of the form OUT,IN", s))
        })?;
        Self::parse(outbound, inbound)
    }
}

fn numeric_port(name: &str, value: &str) -> Result<i64> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| Error::InvalidArgument(format!("{} port {:?} is not a number", name, value)))
}

fn checked_port(name: &str, value: i64) -> Result<u16> {
    u16::try_from(value)
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| {
            Error::InvalidArgument(format!("{} port {} is outside 1-65535", name, value))
        })
}

/// Controls one proxy process: starts it, reconfigures it over the control channel
/// and stops it.
///
/// Call [`TsProxyServer::close`] when done. A controller dropped without closing kills
/// its process and gives its ports back to the pool.
#[derive(Debug)]
pub struct TsProxyServer {
    config: ProxyConfig,
    pool: PortPool,
    supervisor: Supervisor,
    state: State,
    ports: Option<PortBinding>,
    /// Ports taken from the pool, released on close.
    allocated: Vec<u16>,
    process: Option<ProxyProcess>,
    channel: Option<ControlChannel>,
    settings: TrafficSettings,
    port_map: Option<OutboundPortMap>,
}

impl TsProxyServer {
    pub fn new(config: ProxyConfig, pool: PortPool) -> Self {
        let supervisor = Supervisor::new(&config);
        Self {
            config,
            pool,
            supervisor,
            state: State::Unopened,
            ports: None,
            allocated: Vec::new(),
            process: None,
            channel: None,
            settings: TrafficSettings::default(),
            port_map: None,
        }
    }

    /// Creates a controller and starts its proxy.
    pub async fn open(config: ProxyConfig, pool: PortPool) -> Result<Self> {
        let mut server = Self::new(config, pool);
        server.start().await?;
        Ok(server)
    }

    /// Starts the proxy process and connects the control channel.
    ///
    /// Invalid explicit ports are reported without leaving the Unopened state. Any other
    /// failure stops whatever was started and leaves the controller Failed.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != State::Unopened {
            return Err(Error::NotOpen(self.state));
        }
        self.config.validate()?;

        self.state = State::Starting;
        match self.start_inner().await {
            Ok(()) => {
                self.state = State::Ready;
                Ok(())
            }
            Err(e) => {
                error!("Failed to start proxy: {}", e);
                self.state = State::Failed;
                if let Err(stop_error) = self.teardown(false).await {
                    warn!("Cleanup after failed start: {}", stop_error);
                }
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self) -> Result<()> {
        let ports = self.bind_ports()?;
        self.ports = Some(ports);

        let process = self
            .supervisor
            .start(self.config.launcher.as_ref(), ports)
            .await?;
        self.process = Some(process);

        let channel =
            ControlChannel::connect(control_addr(ports.control), self.config.command_timeout)
                .await?;
        debug!("Control channel connected to {}", channel.addr());
        self.channel = Some(channel);
        Ok(())
    }

    fn bind_ports(&mut self) -> Result<PortBinding> {
        let missing = self.config.missing_ports();
        let allocated = self.pool.allocate(missing)?;
        self.allocated = allocated.clone();

        let mut free = allocated.into_iter();
        let mut next = || {
            free.next().ok_or_else(|| Error::PortAllocation {
                requested: missing,
                reason: "port pool returned too few ports".into(),
            })
        };
        let control = match self.config.control_port {
            Some(port) => port,
            None => next()?,
        };
        let (outbound, inbound) = match (self.config.outbound_port, self.config.inbound_port) {
            (Some(outbound), Some(inbound)) => (outbound, inbound),
            _ => (next()?, next()?),
        };
        Ok(PortBinding {
            control,
            outbound,
            inbound,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The control port, while Ready.
    pub fn port(&self) -> Option<u16> {
        self.ports().map(|ports| ports.control)
    }

    /// All ports the process was started with, while Ready.
    pub fn ports(&self) -> Option<PortBinding> {
        self.ports.filter(|_| self.state == State::Ready)
    }

    /// PID of the proxy process, until it is stopped.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ProxyProcess::pid)
    }

    /// The command line the proxy process was started with, until it is stopped.
    pub fn command_line(&self) -> Option<&str> {
        self.process.as_ref().map(ProxyProcess::command_line)
    }

    /// Whether the proxy process is still running.
    pub fn is_process_alive(&mut self) -> bool {
        self.process.as_mut().map_or(false, ProxyProcess::is_alive)
    }

    pub fn traffic_settings(&self) -> TrafficSettings {
        self.settings
    }

    pub fn outbound_port_map(&self) -> Option<OutboundPortMap> {
        self.port_map
    }

    /// Remaps outbound traffic. Invalid ports are rejected before anything is sent.
    pub async fn update_outbound_ports(&mut self, outbound: i64, inbound: i64) -> Result<()> {
        self.ensure_ready()?;
        let map = OutboundPortMap::new(outbound, inbound)?;
        self.set_outbound_port_map(map).await
    }

    pub async fn set_outbound_port_map(&mut self, map: OutboundPortMap) -> Result<()> {
        self.ensure_ready()?;
        self.send(Command::SetPortMap {
            outbound: map.outbound,
            inbound: map.inbound,
        })
        .await?;
        self.port_map = Some(map);
        Ok(())
    }

    /// Applies the given fields in order: latency, download, upload. Each is its own
    /// command; fields applied before a failure stay applied.
    pub async fn update_traffic_settings(&mut self, update: TrafficUpdate) -> Result<()> {
        self.ensure_ready()?;

        if let Some(ms) = update.round_trip_latency_ms {
            self.send(Command::SetRoundTripTime(ms)).await?;
            self.settings.round_trip_latency_ms = Some(ms);
        }
        if let Some(kbps) = update.download_bandwidth_kbps {
            self.send(Command::SetDownloadRate(kbps)).await?;
            self.settings.download_bandwidth_kbps = Some(kbps);
        }
        if let Some(kbps) = update.upload_bandwidth_kbps {
            self.send(Command::SetUploadRate(kbps)).await?;
            self.settings.upload_bandwidth_kbps = Some(kbps);
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            State::Ready => Ok(()),
            state => Err(Error::NotOpen(state)),
        }
    }

    async fn send(&mut self, command: Command) -> Result<()> {
        self.ensure_ready()?;
        let channel = self.channel.as_mut().ok_or(Error::NotOpen(self.state))?;
        match channel.send_command(&command).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_fatal() {
                    error!("Control channel lost, proxy is now unusable: {}", e);
                    self.state = State::Failed;
                }
                Err(e)
            }
        }
    }

    /// Stops the process and closes the channel. Safe to call in any state, any number
    /// of times; after the first call the controller is Closed.
    pub async fn close(&mut self) -> Result<()> {
        let graceful = match self.state {
            State::Closed => return Ok(()),
            State::Unopened => {
                self.state = State::Closed;
                return Ok(());
            }
            State::Ready => true,
            State::Starting | State::Failed => false,
        };

        let result = self.teardown(graceful).await;
        self.state = State::Closed;
        result
    }

    async fn teardown(&mut self, graceful: bool) -> Result<()> {
        if let Some(mut channel) = self.channel.take() {
            if graceful {
                let grace = self.config.stop_grace_period;
                match tokio::time::timeout(grace, channel.send_command(&Command::Exit)).await {
                    Ok(Ok(())) => debug!("Proxy acknowledged exit"),
                    Ok(Err(e)) => debug!("Proxy did not acknowledge exit: {}", e),
                    Err(_) => debug!("Proxy did not acknowledge exit within {:?}", grace),
                }
            }
            channel.close().await;
        }

        let result = match self.process.as_mut() {
            Some(process) => self.supervisor.stop(process).await,
            None => Ok(()),
        };
        self.process = None;
        self.ports = None;
        self.release_ports();
        result
    }

    fn release_ports(&mut self) {
        if !self.allocated.is_empty() {
            self.pool.release(&self.allocated);
            self.allocated.clear();
        }
    }
}

impl Drop for TsProxyServer {
    fn drop(&mut self) {
        if let Some(process) = self.process.take() {
            warn!(
                "Proxy process {} dropped without close(); killing it",
                process.pid()
            );
        }
        self.release_ports();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_map_validation() {
        let map = OutboundPortMap::new(31242, 14220).unwrap();
        assert_eq!(map.outbound(), 31242);
        assert_eq!(map.inbound(), 14220);

        for (outbound, inbound) in [(0, 1), (1, 0), (65536, 1), (1, -1), (80, 80)] {
            assert!(
                matches!(
                    OutboundPortMap::new(outbound, inbound),
                    Err(Error::InvalidArgument(_))
                ),
                "{} {}",
                outbound,
                inbound
            );
        }
        assert!(OutboundPortMap::new(1, 65535).is_ok());
    }

    #[test]
    fn test_port_map_non_numeric() {
        let err = OutboundPortMap::parse("31242", "abcde").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(ref m) if m.contains("abcde")));
        assert!("31242,14220".parse::<OutboundPortMap>().is_ok());
        assert!("31242".parse::<OutboundPortMap>().is_err());
        assert!("31242,x".parse::<OutboundPortMap>().is_err());
        assert_eq!(
            "31242, 14220".parse::<OutboundPortMap>().unwrap().to_string(),
            "31242,14220"
        );
    }

    #[test]
    fn test_traffic_update_builder() {
        assert!(TrafficUpdate::new().is_empty());
        let update = TrafficUpdate::new()
            .round_trip_latency_ms(100)
            .upload_bandwidth_kbps(2000);
        assert!(!update.is_empty());
        assert_eq!(update.round_trip_latency_ms, Some(100));
        assert_eq!(update.download_bandwidth_kbps, None);
        assert_eq!(update.upload_bandwidth_kbps, Some(2000));
    }

    #[tokio::test]
    async fn test_unopened_controller() {
        let mut server = TsProxyServer::new(ProxyConfig::default(), PortPool::new());
        assert_eq!(server.state(), State::Unopened);
        assert_eq!(server.port(), None);
        let err = server
            .update_traffic_settings(TrafficUpdate::new().round_trip_latency_ms(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotOpen(State::Unopened)));

        server.close().await.unwrap();
        assert_eq!(server.state(), State::Closed);
        assert!(matches!(server.start().await, Err(Error::NotOpen(State::Closed))));
    }

    #[tokio::test]
    async fn test_closed_controller_reports_not_open_before_argument_errors() {
        let mut server = TsProxyServer::new(ProxyConfig::default(), PortPool::new());
        let err = server.update_outbound_ports(31242, 70000).await.unwrap_err();
        assert!(matches!(err, Error::NotOpen(State::Unopened)), "{:?}", err);

        server.close().await.unwrap();
        let err = server.update_outbound_ports(31242, 70000).await.unwrap_err();
        assert!(matches!(err, Error::NotOpen(State::Closed)), "{:?}", err);
        let err = server.update_outbound_ports(0, 0).await.unwrap_err();
        assert!(matches!(err, Error::NotOpen(State::Closed)), "{:?}", err);
        let map = OutboundPortMap::new(31242, 14220).unwrap();
        let err = server.set_outbound_port_map(map).await.unwrap_err();
        assert!(matches!(err, Error::NotOpen(State::Closed)), "{:?}", err);
        assert_eq!(server.outbound_port_map(), None);
    }

    #[tokio::test]
    async fn test_invalid_ports_do_not_leave_unopened() {
        let config = ProxyConfig::default().with_data_ports(5000, 5000);
        let mut server = TsProxyServer::new(config, PortPool::new());
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(server.state(), State::Unopened);
    }

    #[tokio::test]
    async fn test_failed_start_releases_ports() {
        let pool = PortPool::new();
        let config = ProxyConfig::new(crate::supervisor::TsProxyLauncher::new(
            "/nonexistent/tsproxy-binary",
        ));
        let mut server = TsProxyServer::new(config, pool.clone());
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }), "{:?}", err);
        assert_eq!(server.state(), State::Failed);
        assert!(server.allocated.is_empty());
        assert_eq!(server.port(), None);

        let err = server
            .update_outbound_ports(31242, 14220)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotOpen(State::Failed)));
        server.close().await.unwrap();
        assert_eq!(server.state(), State::Closed);
    }
}
