//! Spawning, readiness detection and termination of the proxy process.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

use crate::channel::ControlChannel;
use crate::config::{PortBinding, ProxyConfig};
use crate::error::{Error, Result};
use crate::protocol;

/// Number of stderr lines kept for startup diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for stderr to drain once the process has exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Anything that can be started on a [`PortBinding`] and then honors the control protocol.
pub trait Launcher: Debug + Send + Sync {
    /// Builds the command that starts a proxy on `ports`.
    fn command(&self, ports: &PortBinding) -> Command;
}

/// Launches a `tsproxy`-compatible program.
#[derive(Clone, Debug)]
pub struct TsProxyLauncher {
    program: PathBuf,
    /// Placed before the port arguments.
    args: Vec<String>,
    dest_host: Option<IpAddr>,
}

impl TsProxyLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dest_host: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Redirects every proxied connection to `host`.
    pub fn with_dest_host(mut self, host: IpAddr) -> Self {
        self.dest_host = Some(host);
        self
    }
}

impl Launcher for TsProxyLauncher {
    fn command(&self, ports: &PortBinding) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(protocol::launch_args(ports, self.dest_host));
        command
    }
}

/// A spawned proxy process. Only [`Supervisor::stop`] terminates it; dropping it kills it.
#[derive(Debug)]
pub struct ProxyProcess {
    child: Option<Child>,
    pid: u32,
    command_line: String,
    ports: PortBinding,
    stderr: StderrTail,
}

impl ProxyProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Whether the process has been started, not stopped, and has not exited on its own.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => child
                .try_wait()
                .map_err(|e| Error::Startup(format!("failed to poll process {}: {}", self.pid, e))),
            None => Err(Error::Startup(format!("process {} was already stopped", self.pid))),
        }
    }

    async fn exited_early(&mut self, status: ExitStatus) -> Error {
        let stderr = self.stderr.drain().await;
        Error::Startup(format!(
            "`{}` exited with {} before becoming ready; stderr: {}",
            self.command_line,
            status,
            if stderr.is_empty() { "<empty>" } else { stderr.as_str() }
        ))
    }
}

/// Keeps the last lines written to the process' stderr, which is otherwise only logged.
#[derive(Debug, Default)]
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    task: Option<JoinHandle<()>>,
}

impl StderrTail {
    fn capture(pid: u32, stderr: ChildStderr) -> Self {
        let lines: Arc<Mutex<VecDeque<String>>> = Arc::default();
        let task = {
            let lines = lines.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    debug!("[{}] stderr: {}", pid, line);
                    if let Ok(mut lines) = lines.lock() {
                        lines.push_back(line);
                        while lines.len() > STDERR_TAIL_LINES {
                            lines.pop_front();
                        }
                    }
                }
            })
        };
        Self {
            lines,
            task: Some(task),
        }
    }

    /// Waits briefly for the pipe to close, then returns what was captured.
    async fn drain(&mut self) -> String {
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await.is_err() {
                trace!("stderr still open after process exit");
            }
        }
        self.lines
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join(" | "))
            .unwrap_or_default()
    }
}

/// Starts proxy processes and guarantees their termination.
#[derive(Clone, Debug)]
pub struct Supervisor {
    startup_timeout: Duration,
    command_timeout: Duration,
    stop_grace_period: Duration,
    poll_interval: Duration,
}

impl Supervisor {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            startup_timeout: config.startup_timeout,
            command_timeout: config.command_timeout,
            stop_grace_period: config.stop_grace_period,
            poll_interval: config.poll_interval,
        }
    }

    /// Spawns the process and waits until it answers the liveness probe.
    ///
    /// On any failure the process is stopped before the error is returned.
    pub async fn start(&self, launcher: &dyn Launcher, ports: PortBinding) -> Result<ProxyProcess> {
        let control_addr = control_addr(ports.control);

        // A probe answered by someone else's proxy must not count as readiness.
        if TcpStream::connect(control_addr).await.is_ok() {
            return Err(Error::Startup(format!(
                "control port {} is already accepting connections",
                ports.control
            )));
        }

        let mut command = launcher.command(&ports);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let command_line = format!("{:?}", command.as_std());

        info!("Starting proxy: {}", command_line);
        let mut child = command.spawn().map_err(|source| Error::Spawn {
            command: command_line.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        let stderr = child
            .stderr
            .take()
            .map(|stderr| StderrTail::capture(pid, stderr))
            .unwrap_or_default();

        let mut process = ProxyProcess {
            child: Some(child),
            pid,
            command_line,
            ports,
            stderr,
        };

        let ready = tokio::time::timeout(self.startup_timeout, self.wait_ready(&mut process))
            .await
            .unwrap_or(Err(Error::StartupTimeout(self.startup_timeout)));

        match ready {
            Ok(()) => {
                info!("Proxy process {} ready ({})", pid, ports);
                Ok(process)
            }
            Err(e) => {
                if let Err(stop_error) = self.stop(&mut process).await {
                    warn!("Failed to clean up proxy process {}: {}", pid, stop_error);
                }
                Err(e)
            }
        }
    }

    async fn wait_ready(&self, process: &mut ProxyProcess) -> Result<()> {
        let addr = control_addr(process.ports.control);
        loop {
            if let Some(status) = process.try_wait()? {
                return Err(process.exited_early(status).await);
            }

            match self.probe(addr).await {
                Ok(()) => {
                    return match process.try_wait()? {
                        Some(status) => Err(process.exited_early(status).await),
                        None => Ok(()),
                    };
                }
                Err(e) => trace!("Proxy {} not ready yet: {}", process.pid, e),
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn probe(&self, addr: SocketAddr) -> Result<()> {
        let mut channel = ControlChannel::connect(addr, self.command_timeout).await?;
        let result = channel.send_command(&protocol::Command::Ping).await;
        channel.close().await;
        result
    }

    /// Interrupts the process, then kills it if it outlives the grace period.
    ///
    /// Stopping an already-stopped process does nothing.
    pub async fn stop(&self, process: &mut ProxyProcess) -> Result<()> {
        let pid = process.pid;
        let mut child = match process.child.take() {
            Some(child) => child,
            None => return Ok(()),
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("Proxy process {} already exited with {}", pid, status);
            return Ok(());
        }

        if interrupt(pid) {
            match tokio::time::timeout(self.stop_grace_period, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("Proxy process {} exited with {}", pid, status);
                    return Ok(());
                }
                Ok(Err(source)) => return Err(Error::Stop { pid, source }),
                Err(_) => warn!(
                    "Proxy process {} still alive {:?} after interrupt; killing",
                    pid, self.stop_grace_period
                ),
            }
        }

        match child.kill().await {
            Ok(()) => {
                info!("Proxy process {} killed", pid);
                Ok(())
            }
            Err(source) => match child.try_wait() {
                Ok(Some(_)) => Ok(()),
                _ => Err(Error::Stop { pid, source }),
            },
        }
    }
}

pub(crate) fn control_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Sends SIGINT. Returns whether a graceful stop can be waited for.
#[cfg(unix)]
fn interrupt(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => match kill(Pid::from_raw(raw), Signal::SIGINT) {
            Ok(()) => true,
            Err(e) => {
                debug!("Failed to interrupt proxy process {}: {}", pid, e);
                false
            }
        },
        _ => false,
    }
}

#[cfg(not(unix))]
fn interrupt(_pid: u32) -> bool {
    false
}
