use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::protocol::{Command, Response};

/// Request/response client for the proxy's control port.
///
/// Methods take `&mut self`, so a connection never has more than one command in
/// flight. Once a round-trip fails (I/O error, timeout, garbled response) the
/// channel refuses further commands: a late response could otherwise be read as
/// the answer to the next command.
#[derive(Debug)]
pub struct ControlChannel {
    addr: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
    broken: bool,
}

impl ControlChannel {
    /// Opens a connection to the control port. `timeout` bounds the connect and every
    /// later round-trip.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Connection {
                addr,
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| Error::Connection { addr, source })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
        }

        let (reader, writer) = stream.into_split();
        Ok(Self {
            addr,
            reader: BufReader::new(reader),
            writer,
            timeout,
            broken: false,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sends `command` and checks that it was acknowledged.
    pub async fn send_command(&mut self, command: &Command) -> Result<()> {
        let line = command.to_string();
        let response = self.send_line(&line).await?;
        match response.parse::<Response>() {
            Ok(Response::Ok) => Ok(()),
            Ok(Response::Error(message)) => {
                error!("[{}] Proxy failed to execute `{}`: {}", self.addr, line, message);
                Err(Error::CommandRejected {
                    command: line,
                    message,
                })
            }
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    /// Writes one line and returns the single line written back, without its terminator.
    pub async fn send_line(&mut self, line: &str) -> Result<String> {
        if line.contains('\n') {
            return Err(Error::InvalidArgument(format!(
                "command {:?} spans several lines",
                line
            )));
        }
        if self.broken {
            return Err(Error::ChannelClosed(format!(
                "an earlier command on {} failed",
                self.addr
            )));
        }

        debug!("[{}] -> {}", self.addr, line);
        let result = match tokio::time::timeout(self.timeout, self.round_trip(line)).await {
            Ok(result) => result,
            Err(_) => Err(Error::CommandTimeout {
                command: line.to_string(),
                timeout: self.timeout,
            }),
        };
        match &result {
            Ok(response) => debug!("[{}] <- {}", self.addr, response),
            Err(e) => {
                error!("[{}] `{}` failed: {}", self.addr, line, e);
                self.broken = true;
            }
        }
        result
    }

    async fn round_trip(&mut self, line: &str) -> Result<String> {
        let mut request = String::with_capacity(line.len() + 1);
        request.push_str(line);
        request.push('\n');
        self.writer
            .write_all(request.as_bytes())
            .await
            .map_err(|e| Error::ChannelClosed(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::ChannelClosed(e.to_string()))?;

        let mut response = String::new();
        let read = self
            .reader
            .read_line(&mut response)
            .await
            .map_err(|e| Error::ChannelClosed(e.to_string()))?;
        if read == 0 {
            return Err(Error::ChannelClosed("connection closed by proxy".into()));
        }
        Ok(response.trim_end_matches(&['\r', '\n'][..]).to_string())
    }

    /// Shuts down the write half; the proxy sees end-of-stream.
    pub async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            trace!("[{}] Failed to shut down control connection: {}", self.addr, e);
        }
    }
}
