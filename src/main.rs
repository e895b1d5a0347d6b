#[macro_use]
extern crate log;

use anyhow::Context;
use tsproxy_ctl::config::Config;
use tsproxy_ctl::{PortPool, TsProxyServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args().with_context(|| "Failed to read config")?;
    init_logger(&config)?;

    let mut server = TsProxyServer::open(config.proxy.clone(), PortPool::new())
        .await
        .with_context(|| "Failed to start proxy")?;

    let result = run(&mut server, &config).await;
    let closed = server.close().await.with_context(|| "Failed to stop proxy");
    result.and(closed)
}

async fn run(server: &mut TsProxyServer, config: &Config) -> anyhow::Result<()> {
    if let Some(ports) = server.ports() {
        info!("Proxy listening for control commands on port {} ({})", ports.control, ports);
    }

    if let Some(map) = config.port_map {
        server
            .set_outbound_port_map(map)
            .await
            .with_context(|| format!("Failed to remap outbound ports to {}", map))?;
    }

    if !config.traffic.is_empty() {
        server
            .update_traffic_settings(config.traffic)
            .await
            .with_context(|| "Failed to apply traffic settings")?;
        info!("Traffic settings: {:?}", server.traffic_settings());
    }

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    Ok(())
}

fn init_logger(config: &Config) -> anyhow::Result<()> {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.parse_filters(&config.log);
    builder
        .try_init()
        .with_context(|| "Failed to initialize logger")?;
    Ok(())
}
