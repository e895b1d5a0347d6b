#[macro_use]
extern crate log;

pub mod channel;
pub mod config;
pub mod emulator;
pub mod error;
pub mod port_pool;
pub mod protocol;
pub mod server;
pub mod supervisor;

pub use crate::config::{PortBinding, ProxyConfig};
pub use crate::error::{Error, Result};
pub use crate::port_pool::PortPool;
pub use crate::server::{OutboundPortMap, State, TrafficSettings, TrafficUpdate, TsProxyServer};
pub use crate::supervisor::{Launcher, TsProxyLauncher};
