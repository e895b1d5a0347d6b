//! The line-oriented control protocol spoken by the proxy process, and the
//! command-line ABI used to launch it.
//!
//! Every command is a single `\n`-terminated line and is answered with exactly one
//! line: `OK`, or `ERROR` optionally followed by a message.

use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use std::str::FromStr;

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{char, space1, u16 as port_number, u32 as number};
use nom::combinator::{all_consuming, map, opt, rest, value};
use nom::sequence::{preceded, separated_pair, tuple};
use nom::IResult;

use crate::config::PortBinding;
use crate::error::Error;

/// Traffic to this port is routed to the inbound data port; everything else to the outbound one.
pub const HTTPS_PORT: u16 = 443;

/// A control command understood by the proxy process.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Command {
    /// Round-trip latency, in milliseconds.
    SetRoundTripTime(u32),
    /// Download bandwidth cap, in kbps.
    SetDownloadRate(u32),
    /// Upload bandwidth cap, in kbps.
    SetUploadRate(u32),
    /// Remaps the data ports traffic is forwarded to.
    SetPortMap { outbound: u16, inbound: u16 },
    /// Liveness probe.
    Ping,
    /// Asks the process to exit after acknowledging.
    Exit,
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::SetRoundTripTime(ms) => write!(f, "set rtt {}", ms),
            Command::SetDownloadRate(kbps) => write!(f, "set inkbps {}", kbps),
            Command::SetUploadRate(kbps) => write!(f, "set outkbps {}", kbps),
            Command::SetPortMap { outbound, inbound } => {
                write!(f, "set mapports {}", map_ports_spec(*outbound, *inbound))
            }
            Command::Ping => write!(f, "ping"),
            Command::Exit => write!(f, "exit"),
        }
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        all_consuming(command)(s.trim_end())
            .map(|(_, command)| command)
            .map_err(|_| Error::InvalidArgument(format!("unrecognized command {:?}", s)))
    }
}

/// The single-line answer to a [`Command`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Response {
    Ok,
    Error(String),
}

impl Display for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Ok => write!(f, "OK"),
            Response::Error(message) if message.is_empty() => write!(f, "ERROR"),
            Response::Error(message) => write!(f, "ERROR {}", message),
        }
    }
}

impl FromStr for Response {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        all_consuming(response)(s.trim_end_matches(&['\r', '\n'][..]))
            .map(|(_, response)| response)
            .map_err(|_| Error::UnexpectedResponse(s.to_string()))
    }
}

/// Formats the `--mapports` / `set mapports` value.
pub fn map_ports_spec(outbound: u16, inbound: u16) -> String {
    format!("{}:{},*:{}", HTTPS_PORT, inbound, outbound)
}

/// Parses a `--mapports` value, returning `(outbound, inbound)`.
pub fn parse_map_ports(s: &str) -> Result<(u16, u16), Error> {
    all_consuming(port_map)(s.trim())
        .map(|(_, ports)| ports)
        .map_err(|_| Error::InvalidArgument(format!("invalid port map {:?}", s)))
}

/// Arguments passed to the proxy program, after any launcher-specific prefix.
pub fn launch_args(ports: &PortBinding, dest_host: Option<IpAddr>) -> Vec<String> {
    let mut args = vec![
        format!("--port={}", ports.control),
        format!("--mapports={}", map_ports_spec(ports.outbound, ports.inbound)),
    ];
    if let Some(host) = dest_host {
        args.push(format!("--desthost={}", host));
    }
    args
}

fn command(input: &str) -> IResult<&str, Command> {
    alt((
        set_command,
        value(Command::Ping, tag("ping")),
        value(Command::Exit, tag("exit")),
    ))(input)
}

fn set_command(input: &str) -> IResult<&str, Command> {
    preceded(
        tuple((tag("set"), space1)),
        alt((
            map(
                preceded(tuple((tag("rtt"), space1)), number),
                Command::SetRoundTripTime,
            ),
            map(
                preceded(tuple((tag("inkbps"), space1)), number),
                Command::SetDownloadRate,
            ),
            map(
                preceded(tuple((tag("outkbps"), space1)), number),
                Command::SetUploadRate,
            ),
            map(
                preceded(tuple((tag("mapports"), space1)), port_map),
                |(outbound, inbound)| Command::SetPortMap { outbound, inbound },
            ),
        )),
    )(input)
}

/// `443:<inbound>,*:<outbound>`, returned as `(outbound, inbound)`.
fn port_map(input: &str) -> IResult<&str, (u16, u16)> {
    map(
        separated_pair(
            preceded(tag("443:"), port_number),
            char(','),
            preceded(tag("*:"), port_number),
        ),
        |(inbound, outbound)| (outbound, inbound),
    )(input)
}

fn response(input: &str) -> IResult<&str, Response> {
    alt((
        value(Response::Ok, tag("OK")),
        map(
            preceded(tag("ERROR"), opt(preceded(char(' '), rest))),
            |message: Option<&str>| Response::Error(message.unwrap_or_default().to_string()),
        ),
    ))(input)
}
