use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Errors surfaced by the proxy controller and its collaborators.
///
/// None of these are retried internally. Anything other than
/// [`Error::InvalidArgument`], [`Error::CommandRejected`] and [`Error::NotOpen`]
/// leaves the controller unusable; it should be closed and discarded.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No free local TCP port could be found.
    #[error("failed to allocate {requested} free port(s): {reason}")]
    PortAllocation { requested: usize, reason: String },

    /// The proxy program could not be executed at all.
    #[error("failed to spawn proxy process `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The process did not answer the liveness probe in time.
    #[error("proxy process did not become ready within {0:?}")]
    StartupTimeout(Duration),

    /// The process exited (or could not take its ports) before becoming ready.
    #[error("proxy process failed to start: {0}")]
    Startup(String),

    /// The control port could not be reached.
    #[error("failed to connect to control port {addr}: {source}")]
    Connection {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The control connection was lost mid-session.
    #[error("control channel closed: {0}")]
    ChannelClosed(String),

    /// No response arrived within the command timeout.
    #[error("no response to `{command}` within {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    /// The process answered `ERROR`.
    #[error("proxy rejected `{command}`: {message}")]
    CommandRejected { command: String, message: String },

    /// The process answered something that is neither `OK` nor `ERROR`.
    #[error("unexpected response from proxy: {0:?}")]
    UnexpectedResponse(String),

    /// Precondition violation by the caller. Nothing was sent to the process.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The controller is not in the Ready state.
    #[error("proxy is not open (state: {0})")]
    NotOpen(crate::server::State),

    /// The process could not be terminated or reaped.
    #[error("failed to stop proxy process {pid}: {source}")]
    Stop {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Whether the error means the control channel can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::InvalidArgument(_) | Error::CommandRejected { .. } | Error::NotOpen(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::State;

    #[test]
    fn test_fatal_classification() {
        assert!(!Error::InvalidArgument("x".into()).is_fatal());
        assert!(!Error::NotOpen(State::Closed).is_fatal());
        assert!(!Error::CommandRejected {
            command: "set rtt 1".into(),
            message: "nope".into()
        }
        .is_fatal());
        assert!(Error::ChannelClosed("eof".into()).is_fatal());
        assert!(Error::StartupTimeout(Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn test_display_mentions_state() {
        let e = Error::NotOpen(State::Failed);
        assert_eq!(e.to_string(), "proxy is not open (state: Failed)");
    }
}
