//! A stand-in proxy that speaks the control protocol but shapes no traffic.
//!
//! It records the settings it is given, which makes it useful for developing against
//! the controller without a real traffic-shaping proxy installed.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::protocol::{Command, Response};

/// Settings applied to an emulated proxy so far.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ShapingState {
    pub round_trip_latency_ms: Option<u32>,
    pub download_bandwidth_kbps: Option<u32>,
    pub upload_bandwidth_kbps: Option<u32>,
    /// `(outbound, inbound)`
    pub port_map: Option<(u16, u16)>,
    pub dest_host: Option<IpAddr>,
    /// Every line received except `ping`, in arrival order.
    pub commands: Vec<String>,
}

impl ShapingState {
    fn apply(&mut self, command: Command) -> Result<(), String> {
        match command {
            Command::SetRoundTripTime(ms) => self.round_trip_latency_ms = Some(ms),
            Command::SetDownloadRate(kbps) => self.download_bandwidth_kbps = Some(kbps),
            Command::SetUploadRate(kbps) => self.upload_bandwidth_kbps = Some(kbps),
            Command::SetPortMap { outbound, inbound } => {
                if outbound == 0 || inbound == 0 || outbound == inbound {
                    return Err(format!("invalid port map {},{}", outbound, inbound));
                }
                self.port_map = Some((outbound, inbound));
            }
            Command::Ping | Command::Exit => {}
        }
        Ok(())
    }
}

pub struct Emulator {
    listener: TcpListener,
    state: Arc<Mutex<ShapingState>>,
    shutdown: Arc<Notify>,
    options: Options,
}

#[derive(Debug, Default)]
struct Options {
    command_log: Option<PathBuf>,
    response_delay: Duration,
}

impl Emulator {
    /// Binds the control port on the loopback interface. Port 0 picks any free port.
    pub async fn bind(control_port: u16, initial: ShapingState) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, control_port))
            .await
            .with_context(|| format!("Failed to bind control port {}", control_port))?;
        Ok(Self {
            listener,
            state: Arc::new(Mutex::new(initial)),
            shutdown: Arc::new(Notify::new()),
            options: Options::default(),
        })
    }

    /// Appends every recorded command to `path`, one per line, before answering it.
    pub fn with_command_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.command_log = Some(path.into());
        self
    }

    /// Answers everything except `ping` only after `delay`.
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.options.response_delay = delay;
        self
    }

    pub fn control_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .with_context(|| "Failed to read control address")
    }

    /// Shared view of the applied settings.
    pub fn state(&self) -> Arc<Mutex<ShapingState>> {
        self.state.clone()
    }

    /// Serves control connections until a client sends `exit`.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("Started control server on {}", self.control_addr()?);
        let Self {
            listener,
            state,
            shutdown,
            options,
        } = self;
        let options = Arc::new(options);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Exit requested by control client");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (socket, peer_addr) = accepted
                        .with_context(|| "Failed to accept control connection")?;
                    debug!("Control connection from {}", peer_addr);

                    let state = state.clone();
                    let shutdown = shutdown.clone();
                    let options = options.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_control_connection(socket, state, shutdown, options).await
                        {
                            error!("[{}] Control connection failed: {:?}", peer_addr, e);
                        }
                    });
                }
            }
        }
    }
}

async fn handle_control_connection(
    socket: TcpStream,
    state: Arc<Mutex<ShapingState>>,
    shutdown: Arc<Notify>,
    options: Arc<Options>,
) -> anyhow::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| "Failed to read command")?
    {
        let command = line.parse::<Command>();
        let exit = matches!(command, Ok(Command::Exit));
        let ping = matches!(command, Ok(Command::Ping));
        if !ping {
            record(&line, &state, &options).await?;
        }
        let response = match command {
            Ok(command) => {
                let applied = state
                    .lock()
                    .map_err(|_| "state lock poisoned".to_string())
                    .and_then(|mut state| state.apply(command));
                match applied {
                    Ok(()) => Response::Ok,
                    Err(message) => Response::Error(message),
                }
            }
            Err(e) => Response::Error(e.to_string()),
        };
        debug!("{:?} -> {}", line, response);
        if !ping && !options.response_delay.is_zero() {
            tokio::time::sleep(options.response_delay).await;
        }

        writer
            .write_all(format!("{}\n", response).as_bytes())
            .await
            .with_context(|| "Failed to write response")?;

        if exit {
            writer.flush().await.ok();
            shutdown.notify_one();
            break;
        }
    }

    Ok(())
}

async fn record(line: &str, state: &Mutex<ShapingState>, options: &Options) -> anyhow::Result<()> {
    if let Ok(mut state) = state.lock() {
        state.commands.push(line.to_string());
    }
    if let Some(path) = &options.command_log {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open command log {}", path.display()))?;
        file.write_all(format!("{}\n", line).as_bytes())
            .await
            .with_context(|| "Failed to write command log")?;
        file.flush().await.with_context(|| "Failed to flush command log")?;
    }
    Ok(())
}
