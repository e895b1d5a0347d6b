#[macro_use]
extern crate log;

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use clap::{Arg, Command};
use tsproxy_ctl::emulator::{Emulator, ShapingState};
use tsproxy_ctl::protocol::parse_map_ports;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init_custom_env("TSPROXY_LOG");

    let matches = Command::new("tsproxy-emulator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Speaks the tsproxy control protocol without shaping any traffic.")
        .args(&[
            Arg::new("port")
                .long("port")
                .required(true)
                .help("The control port to listen on (127.0.0.1)."),
            Arg::new("mapports")
                .long("mapports")
                .help("Initial port map. Example: 443:37125,*:37124"),
            Arg::new("desthost")
                .long("desthost")
                .help("Destination host connections would be redirected to."),
            Arg::new("startup-delay-ms")
                .long("startup-delay-ms")
                .env("TSPROXY_EMULATOR_STARTUP_DELAY_MS")
                .help("Wait this long before binding the control port."),
            Arg::new("response-delay-ms")
                .long("response-delay-ms")
                .env("TSPROXY_EMULATOR_RESPONSE_DELAY_MS")
                .help("Wait this long before answering any command other than ping."),
            Arg::new("command-log")
                .long("command-log")
                .env("TSPROXY_EMULATOR_COMMAND_LOG")
                .help("Append every command received (except ping) to this file."),
        ])
        .get_matches();

    let control_port: u16 = matches
        .get_one::<String>("port")
        .with_context(|| "Missing control port")?
        .parse()
        .with_context(|| "Invalid control port")?;

    let mut initial = ShapingState::default();
    if let Some(spec) = matches.get_one::<String>("mapports") {
        initial.port_map = Some(parse_map_ports(spec).with_context(|| "Invalid --mapports")?);
    }
    if let Some(host) = matches.get_one::<String>("desthost") {
        initial.dest_host = Some(
            host.parse::<IpAddr>()
                .with_context(|| "Invalid --desthost")?,
        );
    }
    if let Some(delay) = matches.get_one::<String>("startup-delay-ms") {
        let delay: u64 = delay.parse().with_context(|| "Invalid startup delay")?;
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let mut emulator = Emulator::bind(control_port, initial).await?;
    if let Some(delay) = matches.get_one::<String>("response-delay-ms") {
        let delay: u64 = delay.parse().with_context(|| "Invalid response delay")?;
        emulator = emulator.with_response_delay(Duration::from_millis(delay));
    }
    if let Some(path) = matches.get_one::<String>("command-log") {
        emulator = emulator.with_command_log(path);
    }

    tokio::select! {
        result = emulator.run() => result,
        signal = tokio::signal::ctrl_c() => {
            signal.with_context(|| "Failed to listen for interrupt")?;
            info!("Interrupted");
            Ok(())
        }
    }
}
